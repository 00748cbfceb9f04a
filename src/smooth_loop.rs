//! Application-visible cyclic time that never jumps.
//!
//! Animations and similar consumers want a cyclic phase (say a one-second
//! ramp) that follows the disciplined clock but must not step when that clock
//! is nudged or re-baselined. The loop keeps its own offset against the raw
//! system milliseconds and slews it toward the disciplined phase, moving at
//! most `max_percent_adjustment` percent of elapsed real time per call.

/// Reduce a signed distance into `[-half, half)` with two's-complement wrap.
fn wrap_around(input: i32, half: i32) -> i32 {
    if input >= half {
        input - (half << 1)
    } else if input < -half {
        input + (half << 1)
    } else {
        input
    }
}

pub struct SmoothTimeLoop {
    cycle_millis: i32,
    max_percent_adjustment: i32,

    last_system_millis: u32,
    offset_millis: i32,
}

impl SmoothTimeLoop {
    /// `cycle_millis` is the phase period; `max_percent_adjustment` bounds
    /// the slew rate in percent of elapsed time.
    pub fn new(cycle_millis: i32, max_percent_adjustment: i32) -> Self {
        SmoothTimeLoop {
            cycle_millis,
            max_percent_adjustment,
            last_system_millis: 0,
            offset_millis: 0,
        }
    }

    /// Current cyclic phase in `[0, cycle_millis)`, derived from the raw
    /// system clock and slewed toward the disciplined clock's phase.
    ///
    /// The first call may apply an unbounded correction: the elapsed-time
    /// bound starts from an arbitrary origin.
    pub fn cycle_position(&mut self, ptp_millis: u32, system_millis: u32) -> u32 {
        let millis_since_last = system_millis.wrapping_sub(self.last_system_millis) as i32;

        let s = system_millis.wrapping_add(self.offset_millis as u32) % self.cycle_millis as u32;
        let t = ptp_millis % self.cycle_millis as u32;

        let diff = wrap_around(t.wrapping_sub(s) as i32, self.cycle_millis >> 1);

        if diff.abs() > 1 {
            let max_corr = (millis_since_last * self.max_percent_adjustment) / 100;

            let mut correction = diff;
            if correction > max_corr {
                correction = max_corr;
            } else if correction < -max_corr {
                correction = -max_corr;
            }

            self.offset_millis += correction;
        }

        self.last_system_millis = system_millis;

        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_around_picks_shortest_signed_distance() {
        assert_eq!(wrap_around(0, 500), 0);
        assert_eq!(wrap_around(499, 500), 499);
        assert_eq!(wrap_around(500, 500), -500);
        assert_eq!(wrap_around(600, 500), -400);
        assert_eq!(wrap_around(-500, 500), -500);
        assert_eq!(wrap_around(-501, 500), 499);
    }

    #[test]
    fn slew_rate_is_bounded_by_percentage() {
        let mut stl = SmoothTimeLoop::new(1000, 10);

        // disciplined phase leads the system phase by 300 ms throughout
        let mut prev = stl.cycle_position(300, 0);
        for k in 1..40u32 {
            let system = k * 100;
            let s = stl.cycle_position(system.wrapping_add(300), system);

            // 100 ms of real time, correction capped at 10 ms
            let advance = wrap_around(s.wrapping_sub(prev) as i32, 500);
            assert!(
                (90..=110).contains(&advance),
                "advance {} out of bounds at step {}",
                advance,
                k
            );
            prev = s;
        }

        // fully converged: phase now equals the disciplined phase
        let s = stl.cycle_position(4000 + 300, 4000);
        assert_eq!(s, 300);
    }

    #[test]
    fn phase_converges_without_ever_stepping() {
        let mut stl = SmoothTimeLoop::new(1000, 10);
        stl.cycle_position(500, 0);

        let mut converged_at = None;
        for k in 1..60u32 {
            let system = k * 100;
            let s = stl.cycle_position(system.wrapping_add(500), system);
            let lag = wrap_around((system.wrapping_add(500) % 1000).wrapping_sub(s) as i32, 500);
            if lag.abs() <= 1 && converged_at.is_none() {
                converged_at = Some(k);
            }
        }
        // 500 ms to make up at <=10 ms per step
        let k = converged_at.expect("never converged");
        assert!(k >= 50, "converged implausibly fast at step {}", k);
    }

    #[test]
    fn correction_takes_the_short_way_across_the_wrap() {
        let mut stl = SmoothTimeLoop::new(1000, 100);
        stl.cycle_position(0, 0);

        // system phase 950, target phase 30: the short way is +80 forward
        let s = stl.cycle_position(1030, 1950);
        assert_eq!(s, 950);
        assert_eq!(stl.offset_millis, 80);

        // and the phase lands on target on the next read
        let s = stl.cycle_position(2030, 2950);
        assert_eq!(s, (2950u32 + 80) % 1000);
        assert_eq!(s, 30);
    }

    #[test]
    fn no_elapsed_time_means_no_correction() {
        let mut stl = SmoothTimeLoop::new(1000, 10);
        stl.cycle_position(0, 1000);

        let before = stl.offset_millis;
        stl.cycle_position(400, 1000);
        assert_eq!(stl.offset_millis, before);
    }
}
