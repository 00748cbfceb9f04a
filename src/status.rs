use serde::{Deserialize, Serialize};

/// Snapshot of the client's sync state, for the host's status display or a
/// periodic JSON dump.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SyncStatus {
    /// Within the lock window of the master (hysteresis applied).
    pub locked: bool,

    /// Has ever been locked since startup.
    pub ever_locked: bool,

    /// The master carries a real wall-clock epoch, so `epoch_millis` is an
    /// actual date.
    pub epoch_valid: bool,

    /// Most recent peak diff against the master (ms).
    pub last_diff_ms: i16,

    /// Raw packets per second over the last maintenance window.
    pub raw_pps: u16,

    /// Disciplined 64-bit epoch milliseconds at snapshot time.
    pub epoch_millis: u64,

    /// One-line summary: "OK (Nms)", "not OK" or "NOT OK".
    pub summary: String,

    /// Unix timestamp of this snapshot.
    pub updated_ts: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            locked: false,
            ever_locked: false,
            epoch_valid: false,
            last_diff_ms: 0,
            raw_pps: 0,
            epoch_millis: 0,
            summary: "NOT OK".to_string(),
            updated_ts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unlocked() {
        let status = SyncStatus::default();
        assert!(!status.locked);
        assert!(!status.epoch_valid);
        assert_eq!(status.summary, "NOT OK");
    }

    #[test]
    fn serde_roundtrip() {
        let status = SyncStatus {
            locked: true,
            ever_locked: true,
            epoch_valid: true,
            last_diff_ms: -2,
            raw_pps: 9,
            epoch_millis: 1_700_000_000_123,
            summary: "OK (-2ms)".to_string(),
            updated_ts: 1_700_000_000,
        };

        let json = serde_json::to_string(&status).expect("serialize failed");
        let restored: SyncStatus = serde_json::from_str(&json).expect("deserialize failed");

        assert!(restored.locked);
        assert_eq!(restored.last_diff_ms, -2);
        assert_eq!(restored.epoch_millis, 1_700_000_000_123);
        assert_eq!(restored.summary, "OK (-2ms)");
    }
}
