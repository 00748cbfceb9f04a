use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// PTP domain to listen to. Almost always 0.
    #[serde(default)]
    pub domain: u8,

    /// Parameters for the application-facing cyclic phase.
    #[serde(default)]
    pub loop_clock: LoopClockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopClockConfig {
    /// Phase period in milliseconds.
    pub cycle_millis: i32,

    /// Slew bound, percent of elapsed real time.
    pub max_percent_adjustment: i32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            domain: 0,
            loop_clock: LoopClockConfig::default(),
        }
    }
}

impl Default for LoopClockConfig {
    fn default() -> Self {
        LoopClockConfig {
            cycle_millis: 1000,
            max_percent_adjustment: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.domain, 0);
        assert_eq!(cfg.loop_clock.cycle_millis, 1000);
        assert_eq!(cfg.loop_clock.max_percent_adjustment, 10);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: ClientConfig = serde_json::from_str(r#"{"domain": 3}"#).unwrap();
        assert_eq!(cfg.domain, 3);
        assert_eq!(cfg.loop_clock.cycle_millis, 1000);
    }
}
