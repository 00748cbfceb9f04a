//! The disciplined clock.
//!
//! Maintains a wrapping 32-bit offset such that `local_millis + offset`
//! tracks the master's millisecond clock, plus a 64-bit extension for the
//! full epoch value.
//!
//! The filtering is built around one observation about multicast over WiFi:
//! access points batch broadcast/multicast frames up with the DTIM beacon, so
//! sync packets arrive in bursts no matter how smoothly they were sent. A
//! buffered packet arrives *late*, which makes its measured diff smaller, so
//! within a recent window the largest diff belongs to the least-delayed (and
//! therefore freshest) packet. All adjustment decisions run on that peak.
//!
//! Convergence is two-phase: after the first packet a short observation
//! window picks the best baseline and applies it as one jump; from then on
//! the offset is only ever nudged by a single millisecond, with the nudge
//! cadence chosen from the peak magnitude.

use crate::ptp::{PtpPort, SyncPacket};
use log::{debug, info, warn};
use std::cell::Cell;

const DIFF_HISTORY_LEN: usize = 64;
/// Marks a never-written history slot; loses every max() comparison.
const HISTORY_EMPTY: i16 = -32768;

/// Diffs beyond this are rejected outright rather than filtered.
const MAX_DIFF_MS: i32 = 200;
/// How long to observe before the one-time baseline jump.
const INITIAL_DIFF_WINDOW_MS: u32 = 1500;
/// Peak magnitude below which lock engages (and fast-initial ends).
const LOCK_ENTER_MS: i32 = 10;
/// Peak magnitude above which an existing lock is dropped.
const LOCK_EXIT_MS: i32 = 20;
/// Sync packets that must be accepted before lock may engage.
const LOCK_MIN_ACCEPTED: u16 = 5;
/// Lock is dropped after this much silence.
const SYNC_TIMEOUT_MS: u32 = 5000;
/// First epoch value ever accepted must be newer than this (2021-10-11);
/// anything older is a master without a real wall clock.
const EPOCH_SANITY_FLOOR_MS: u64 = 1_633_942_188_395;

/// Reads that would step back by less than this are frozen at the previous
/// value until real time catches up; larger steps in either direction pass
/// through as a genuine re-sync.
pub const BACKWARD_JUMP_WINDOW_MS: i32 = 1000;

pub struct SyncManager {
    first: bool,
    fast_initial: bool,
    initial_diff_finding: bool,
    lock_status: bool,
    epoch_valid: bool,
    epoch_valid_internal: bool,
    two_step: bool,

    offset: u32,
    offset64: u64,
    // published copies, updated only once the baseline jump is behind us
    confident_offset: u32,
    confident_offset64: u64,

    diff_history: [i16; DIFF_HISTORY_LEN],
    diff_history_idx: usize,

    rejected_packets: i16,
    accepted_packets: u16,

    adjustment_ts: u32,
    initial_diff_finding_ts: u32,
    last_accepted_ts: u32,

    two_step_recv_ts: u32,
    two_step_seq_id: u16,

    last_diff_ms: i16,
    last_millis_return: Cell<u32>,
}

impl SyncManager {
    pub fn new() -> Self {
        let mut mgr = SyncManager {
            first: true,
            fast_initial: true,
            initial_diff_finding: false,
            lock_status: false,
            epoch_valid: false,
            epoch_valid_internal: false,
            two_step: false,
            offset: 0,
            offset64: 0,
            confident_offset: 0,
            confident_offset64: 0,
            diff_history: [HISTORY_EMPTY; DIFF_HISTORY_LEN],
            diff_history_idx: 0,
            rejected_packets: 0,
            accepted_packets: 0,
            adjustment_ts: 0,
            initial_diff_finding_ts: 0,
            last_accepted_ts: 0,
            two_step_recv_ts: 0,
            two_step_seq_id: 0,
            last_diff_ms: 0,
            last_millis_return: Cell::new(0),
        };
        mgr.reset(0);
        mgr
    }

    /// Soft reset: back to the first-packet state. Offsets, epoch flags and
    /// two-step correlation are left in place; the next accepted packet
    /// replaces them as the new baseline.
    pub fn reset(&mut self, now: u32) {
        self.first = true;
        self.fast_initial = true;
        self.adjustment_ts = now;
        self.diff_history = [HISTORY_EMPTY; DIFF_HISTORY_LEN];
        self.diff_history_idx = 0;
        self.rejected_packets = 0;
        self.accepted_packets = 0;
        self.lock_status = false;
    }

    pub fn feed_sync(&mut self, pkt: &SyncPacket, port: PtpPort, now: u32) {
        let mut two_step_offset: u32 = 0;

        if port == PtpPort::Event {
            self.two_step = pkt.header.is_two_step();
        }

        if self.two_step {
            match port {
                PtpPort::Event => {
                    // placeholder timestamp; remember when it landed and wait
                    // for the follow-up
                    self.two_step_seq_id = pkt.header.sequence_id;
                    self.two_step_recv_ts = now;
                    return;
                }
                PtpPort::General => {
                    if pkt.header.sequence_id != self.two_step_seq_id {
                        return;
                    }
                    two_step_offset = now.wrapping_sub(self.two_step_recv_ts);
                }
            }
        }

        let ptp_millis = pkt
            .origin_timestamp
            .millis32()
            .wrapping_add(two_step_offset);
        let ptp_millis64 = pkt
            .origin_timestamp
            .millis64()
            .wrapping_add(two_step_offset as u64);

        if self.first {
            // Take the first packet as the baseline even though it may have
            // been one of the badly delayed ones; the observation window
            // below corrects that with a single jump.
            self.offset = ptp_millis.wrapping_sub(now);
            self.adjustment_ts = now;
            self.initial_diff_finding = true;
            self.initial_diff_finding_ts = now;
            self.epoch_valid_internal = ptp_millis64 > EPOCH_SANITY_FLOOR_MS;
            self.offset64 = ptp_millis64.wrapping_sub(now.wrapping_add(self.offset) as u64);
            debug!(
                "baseline: offset={} epoch_millis={} epoch_valid={}",
                self.offset, ptp_millis64, self.epoch_valid_internal
            );
        }

        let diff = ptp_millis.wrapping_sub(self.offset).wrapping_sub(now) as i32;

        if !(-MAX_DIFF_MS..=MAX_DIFF_MS).contains(&diff) {
            self.rejected_packets = self.rejected_packets.saturating_add(1);

            // Rejecting everything for several seconds means it is our own
            // offset that is wrong. Resync from scratch.
            let log_interval = pkt.header.log_message_interval as i32;
            let limit = if log_interval < -2 {
                4i32 << (-log_interval).clamp(0, 16)
            } else {
                16
            };
            if self.rejected_packets as i32 > limit {
                warn!(
                    "lost sync: {} consecutive packets beyond {} ms, resyncing",
                    self.rejected_packets, MAX_DIFF_MS
                );
                self.reset(now);
            }
            return;
        }

        self.rejected_packets = 0;

        self.diff_history[self.diff_history_idx] = diff as i16;
        self.diff_history_idx = (self.diff_history_idx + 1) % DIFF_HISTORY_LEN;

        // Look roughly four seconds back, at least 8 packets, at most the
        // whole buffer.
        let log_interval = pkt.header.log_message_interval as i32;
        let window = if log_interval <= -2 {
            ((4usize) << (-log_interval).clamp(0, 16) as usize).min(DIFF_HISTORY_LEN)
        } else {
            8
        };

        let mut peak: i16 = HISTORY_EMPTY;
        let mut idx = (self.diff_history_idx + DIFF_HISTORY_LEN - 1) % DIFF_HISTORY_LEN;
        for _ in 0..window {
            if peak < self.diff_history[idx] {
                peak = self.diff_history[idx];
            }
            idx = (idx + DIFF_HISTORY_LEN - 1) % DIFF_HISTORY_LEN;
        }

        let mut interval_ms: u32 = 5000;

        self.last_diff_ms = peak;

        let was_diff_finding = self.initial_diff_finding;

        if !self.first
            && self.initial_diff_finding
            && now.wrapping_sub(self.initial_diff_finding_ts) > INITIAL_DIFF_WINDOW_MS
        {
            // One jump straight through the accumulated jitter, keyed off the
            // least-delayed packet seen so far.
            self.initial_diff_finding = false;
            debug!("initial adjustment: {} ms", peak);

            self.offset = self.offset.wrapping_add(peak as i32 as u32);
            for slot in self.diff_history.iter_mut() {
                if *slot != HISTORY_EMPTY {
                    *slot -= peak;
                }
            }
            peak = 0;
        }

        if !was_diff_finding {
            let mag = (peak as i32).abs();

            // Nudges are always one millisecond, so the correction rate is
            // set entirely by the interval.
            if mag >= 3 {
                interval_ms = 2000;
            }
            if mag >= 10 {
                interval_ms = 1000;
            }
            if self.fast_initial {
                if mag >= 20 {
                    interval_ms = 250;
                }
                if mag >= 40 {
                    interval_ms = 125;
                }
            }

            if self.accepted_packets >= LOCK_MIN_ACCEPTED {
                if self.fast_initial && mag < LOCK_ENTER_MS {
                    self.fast_initial = false;
                }

                if !self.lock_status {
                    if mag < LOCK_ENTER_MS {
                        self.lock_status = true;
                        info!("locked (peak diff {} ms)", peak);
                    }
                } else if mag > LOCK_EXIT_MS {
                    self.lock_status = false;
                    info!("lock lost (peak diff {} ms)", peak);
                }
            }

            if now.wrapping_sub(self.adjustment_ts) >= interval_ms {
                self.adjustment_ts = now;

                if peak > 1 {
                    self.offset = self.offset.wrapping_add(1);
                } else if peak < -1 {
                    self.offset = self.offset.wrapping_sub(1);
                }
            }

            self.confident_offset = self.offset;
            self.confident_offset64 = self.offset64;
            self.epoch_valid = self.epoch_valid_internal;
        }

        self.last_accepted_ts = now;
        if self.accepted_packets < u16::MAX {
            self.accepted_packets += 1;
        }
        self.first = false;
    }

    /// Disciplined 32-bit milliseconds. Small backward steps (offset nudges
    /// landing between reads) are clamped to the previous value so consumers
    /// see monotonic time; a step of [`BACKWARD_JUMP_WINDOW_MS`] or more in
    /// either direction is a real re-sync and passes through.
    pub fn millis(&self, now: u32) -> u32 {
        let ret = now.wrapping_add(self.confident_offset);

        let diff = ret.wrapping_sub(self.last_millis_return.get()) as i32;
        if diff < 0 && diff > -BACKWARD_JUMP_WINDOW_MS {
            return self.last_millis_return.get();
        }

        self.last_millis_return.set(ret);
        ret
    }

    /// Full epoch milliseconds including the extra significant bits.
    /// No backward-jump clamping here.
    pub fn epoch_millis64(&self, now: u32) -> u64 {
        (now.wrapping_add(self.confident_offset) as u64).wrapping_add(self.confident_offset64)
    }

    pub fn lock_status(&self) -> bool {
        self.lock_status
    }

    pub fn epoch_valid(&self) -> bool {
        self.epoch_valid
    }

    pub fn last_diff_ms(&self) -> i16 {
        self.last_diff_ms
    }

    /// Runs once per second: drop the lock after five seconds of silence.
    /// Offsets and epoch validity are kept so readers still get a
    /// best-effort time.
    pub fn housekeeping(&mut self, now: u32) {
        if self.lock_status && now.wrapping_sub(self.last_accepted_ts) > SYNC_TIMEOUT_MS {
            self.lock_status = false;
            info!("lock lost (no sync packets for {} ms)", SYNC_TIMEOUT_MS);
        }
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::{MessageType, PortId, PtpHeader, PtpTimestamp};

    fn header(log_interval: i8, two_step: bool, seq: u16) -> PtpHeader {
        PtpHeader {
            message_type: MessageType::Sync,
            version: 2,
            msg_len: 0,
            domain_number: 0,
            flag_field: [if two_step { 0x02 } else { 0x00 }, 0x00],
            correction_field: 0,
            source_port_id: PortId::default(),
            sequence_id: seq,
            control_field: 0,
            log_message_interval: log_interval,
        }
    }

    fn one_step(master_ms: u64, log_interval: i8) -> SyncPacket {
        let secs = master_ms / 1000;
        SyncPacket {
            header: header(log_interval, false, 0),
            origin_timestamp: PtpTimestamp {
                secs_esb: (secs >> 32) as u16,
                secs: secs as u32,
                nanos: ((master_ms % 1000) * 1_000_000) as u32,
            },
        }
    }

    const MASTER_BASE_MS: u64 = 1_700_000_000_000;

    /// Feed zero-diff one-step packets at 250 ms cadence until locked.
    /// Returns (manager, final now, final master ms).
    fn run_cold_lock(base_now: u32, packets: u32) -> (SyncManager, u32, u64) {
        let mut sm = SyncManager::new();
        let mut now = base_now;
        let mut master = MASTER_BASE_MS;
        for _ in 0..packets {
            sm.feed_sync(&one_step(master, -2), PtpPort::Event, now);
            now = now.wrapping_add(250);
            master += 250;
        }
        // undo the trailing increments so callers see the last feed instant
        (sm, now.wrapping_sub(250), master - 250)
    }

    #[test]
    fn cold_lock_with_aligned_master() {
        let (sm, now, master) = run_cold_lock(10_000, 20);

        assert!(sm.lock_status());
        assert!(!sm.fast_initial);
        assert_eq!(sm.last_diff_ms(), 0);
        assert!(sm.epoch_valid());
        assert_eq!(sm.millis(now), master as u32);
        assert_eq!(sm.epoch_millis64(now), master);
    }

    #[test]
    fn lock_needs_five_accepted_and_the_observation_window() {
        let mut sm = SyncManager::new();
        let mut now = 0u32;
        let mut master = MASTER_BASE_MS;
        // 6 packets spanning only 1250 ms: still observing, not locked
        for _ in 0..6 {
            sm.feed_sync(&one_step(master, -2), PtpPort::Event, now);
            now += 250;
            master += 250;
        }
        assert!(!sm.lock_status());
        assert!(sm.initial_diff_finding);
    }

    #[test]
    fn epoch_validity_requires_recent_wall_clock() {
        // master that reports seconds since boot instead of the epoch
        let mut sm = SyncManager::new();
        let mut now = 0u32;
        let mut master = 86_400_000u64;
        for _ in 0..20 {
            sm.feed_sync(&one_step(master, -2), PtpPort::Event, now);
            now += 250;
            master += 250;
        }
        assert!(sm.lock_status());
        assert!(!sm.epoch_valid());
    }

    #[test]
    fn millis_freezes_through_small_backward_steps() {
        let (sm, now, _) = run_cold_lock(10_000, 20);

        let v = sm.millis(now);
        // a read taken 400 ms "earlier" (offset nudged down between reads)
        assert_eq!(sm.millis(now.wrapping_sub(400)), v);
        // still frozen just inside the window
        assert_eq!(sm.millis(now.wrapping_sub(999)), v);
        // a real re-sync sized jump passes through
        let jumped = sm.millis(now.wrapping_sub(5_000));
        assert_eq!(jumped, v.wrapping_sub(5_000));
    }

    #[test]
    fn millis_is_nondecreasing_as_time_advances() {
        let (sm, now, _) = run_cold_lock(0, 20);
        let mut prev = sm.millis(now);
        for step in 1..100u32 {
            let v = sm.millis(now + step * 10);
            assert!(v.wrapping_sub(prev) as i32 >= 0);
            prev = v;
        }
    }

    #[test]
    fn gross_reject_run_forces_resync() {
        let mut sm = SyncManager::new();
        sm.feed_sync(&one_step(MASTER_BASE_MS, 0), PtpPort::Event, 0);
        assert_eq!(sm.accepted_packets, 1);

        let mut now = 100u32;
        for i in 1i32..=17 {
            let master = MASTER_BASE_MS + now as u64 + 300;
            sm.feed_sync(&one_step(master, 0), PtpPort::Event, now);
            if i <= 16 {
                assert_eq!(sm.rejected_packets as i32, i);
            }
            now += 100;
        }

        // the 17th reject tipped it over
        assert!(sm.first);
        assert_eq!(sm.rejected_packets, 0);
        assert_eq!(sm.accepted_packets, 0);
        assert!(!sm.lock_status());

        // the next packet re-baselines at the new timeline
        let master = MASTER_BASE_MS + 9_000_000;
        sm.feed_sync(&one_step(master, 0), PtpPort::Event, now);
        assert!(!sm.first);
        assert_eq!(sm.accepted_packets, 1);
    }

    #[test]
    fn one_good_packet_clears_the_reject_run() {
        let mut sm = SyncManager::new();
        let mut now = 0u32;
        sm.feed_sync(&one_step(MASTER_BASE_MS, 0), PtpPort::Event, now);

        for _ in 0..10 {
            now += 100;
            let master = MASTER_BASE_MS + now as u64 + 300;
            sm.feed_sync(&one_step(master, 0), PtpPort::Event, now);
        }
        assert_eq!(sm.rejected_packets, 10);

        now += 100;
        sm.feed_sync(&one_step(MASTER_BASE_MS + now as u64, 0), PtpPort::Event, now);
        assert_eq!(sm.rejected_packets, 0);
    }

    #[test]
    fn peak_diff_is_window_maximum() {
        let mut sm = SyncManager::new();
        let mut now = 0u32;
        let feed_diff = |sm: &mut SyncManager, now: u32, d: i64| {
            let master = (MASTER_BASE_MS as i64 + now as i64 + d) as u64;
            sm.feed_sync(&one_step(master, 0), PtpPort::Event, now);
        };

        feed_diff(&mut sm, now, 0); // baseline
        for d in [-50i64, -30, -10] {
            now += 100;
            feed_diff(&mut sm, now, d);
        }
        now += 100;
        feed_diff(&mut sm, now, 0);
        assert_eq!(sm.last_diff_ms(), 0);

        // push the fresh sample out of the 8-deep window with stale ones
        for _ in 0..8 {
            now += 100;
            feed_diff(&mut sm, now, -20);
        }
        assert_eq!(sm.last_diff_ms(), -20);
    }

    #[test]
    fn offset_moves_at_most_one_ms_per_adjustment() {
        let (mut sm, mut now, mut master) = run_cold_lock(0, 20);

        let mut nudges = 0u32;
        let mut prev_offset = sm.offset;
        for _ in 0..32 {
            now += 250;
            master += 250;
            // master consistently 5 ms ahead of our disciplined time
            sm.feed_sync(&one_step(master + 5, -2), PtpPort::Event, now);

            let delta = sm.offset.wrapping_sub(prev_offset) as i32;
            assert!(delta == 0 || delta == 1, "offset stepped by {}", delta);
            nudges += delta as u32;
            prev_offset = sm.offset;
        }
        // 8 s of packets, 2000 ms cadence at this magnitude
        assert!(nudges >= 1 && nudges <= 5, "nudges={}", nudges);
    }

    #[test]
    fn two_step_followup_carries_the_elapsed_gap() {
        let mut sm = SyncManager::new();

        let mut first = one_step(0, 0);
        first.header.flag_field[0] = 0x02;
        first.header.sequence_id = 0x1000;
        sm.feed_sync(&first, PtpPort::Event, 1000);
        // placeholder only: nothing accepted yet
        assert!(sm.first);
        assert_eq!(sm.accepted_packets, 0);

        // follow-up with a stale sequence id is ignored
        let mut stale = one_step(MASTER_BASE_MS, 0);
        stale.header.sequence_id = 0x0FFF;
        sm.feed_sync(&stale, PtpPort::General, 1002);
        assert!(sm.first);

        let mut followup = one_step(MASTER_BASE_MS, 0);
        followup.header.sequence_id = 0x1000;
        sm.feed_sync(&followup, PtpPort::General, 1004);
        assert!(!sm.first);
        assert_eq!(sm.accepted_packets, 1);
        // baseline includes the 4 ms between sync and follow-up
        let expected = (MASTER_BASE_MS as u32).wrapping_add(4).wrapping_sub(1004);
        assert_eq!(sm.offset, expected);
    }

    #[test]
    fn housekeeping_drops_lock_after_silence() {
        let (mut sm, now, _) = run_cold_lock(0, 20);
        assert!(sm.lock_status());

        sm.housekeeping(now + 4000);
        assert!(sm.lock_status());

        sm.housekeeping(now + 5001);
        assert!(!sm.lock_status());

        // best-effort time is still served from the retained offsets
        assert!(sm.epoch_valid());
        let before = sm.millis(now);
        assert_eq!(sm.millis(now + 6000), before.wrapping_add(6000));
    }

    #[test]
    fn survives_tick_counter_wraparound() {
        let base = u32::MAX - 1000;
        let (sm, now, master) = run_cold_lock(base, 20);

        // 20 packets at 250 ms crossed the wrap
        assert!(now < base);
        assert!(sm.lock_status());
        assert_eq!(sm.last_diff_ms(), 0);
        assert_eq!(sm.millis(now), master as u32);
    }

    #[test]
    fn soft_reset_keeps_published_time() {
        let (mut sm, now, _) = run_cold_lock(0, 20);
        let before = sm.millis(now);

        sm.reset(now);
        assert!(sm.first);
        assert!(!sm.lock_status());
        // readers keep the last confident time until a new baseline lands
        assert_eq!(sm.millis(now), before);
    }
}
