//! Per-source liveness tracking.
//!
//! A tracker accumulates announce and sync arrivals for one clock source.
//! Counters build up while packets flow and are decayed by the 1 Hz
//! housekeeping at a rate derived from the source's advertised message
//! intervals, so a few seconds of silence drains them back to zero. Health
//! latches on once enough of both message kinds have been seen and is only
//! dropped again when the sync stream has fully drained.

use crate::ptp::{AnnounceFields, AnnouncePacket, PortId, PtpPort, SyncPacket};
use log::debug;

const ANNOUNCE_COUNT_MAX: u8 = 5;
const SYNC_COUNT_MAX: u8 = 10;

/// "no valid source" marker for the log-interval fields.
const LOG_INTERVAL_UNSET: i8 = 0x7F;

#[derive(Debug, Clone)]
pub struct Tracker {
    id: PortId,
    announce: AnnounceFields,

    log_sync_interval: i8,
    log_announce_interval: i8,

    announce_count: u8,
    sync_count: u8,
    sync_count2: u8,

    maint_counter_sync: u8,
    maint_counter_announce: u8,

    healthy: bool,
    two_step: bool,
    is_master: bool,
}

impl Tracker {
    pub fn new(is_master: bool) -> Self {
        let mut t = Tracker {
            id: PortId::default(),
            announce: AnnounceFields::worst(),
            log_sync_interval: LOG_INTERVAL_UNSET,
            log_announce_interval: LOG_INTERVAL_UNSET,
            announce_count: 0,
            sync_count: 0,
            sync_count2: 0,
            maint_counter_sync: 0,
            maint_counter_announce: 0,
            healthy: false,
            two_step: false,
            is_master,
        };
        t.reset();
        t
    }

    pub fn reset(&mut self) {
        self.id = PortId::default();
        self.announce = AnnounceFields::worst();
        self.log_sync_interval = LOG_INTERVAL_UNSET;
        self.log_announce_interval = LOG_INTERVAL_UNSET;
        self.announce_count = 0;
        self.sync_count = 0;
        self.sync_count2 = 0;
        self.maint_counter_sync = 0;
        self.maint_counter_announce = 0;
        self.healthy = false;
        self.two_step = false;
    }

    /// Adopt a new source: wipe state, take its identity, feed the announce.
    pub fn start(&mut self, pkt: &AnnouncePacket) {
        self.reset();
        self.id = pkt.header.source_port_id;
        self.feed_announce(pkt);
    }

    /// Promote: copy `candidate`'s tracking state into this slot, then clear
    /// the candidate. The master flag stays put, and so does the two-step
    /// flag (the next event-port sync refreshes it).
    pub fn take(&mut self, candidate: &mut Tracker) {
        self.id = candidate.id;
        self.announce = candidate.announce;
        self.log_sync_interval = candidate.log_sync_interval;
        self.log_announce_interval = candidate.log_announce_interval;
        self.sync_count = candidate.sync_count;
        self.sync_count2 = candidate.sync_count2;
        self.announce_count = candidate.announce_count;
        self.maint_counter_sync = candidate.maint_counter_sync;
        self.maint_counter_announce = candidate.maint_counter_announce;
        self.healthy = candidate.healthy;

        candidate.reset();
    }

    pub fn feed_announce(&mut self, pkt: &AnnouncePacket) {
        self.log_announce_interval = pkt.header.log_message_interval;
        self.announce = pkt.announce;

        if self.announce_count < ANNOUNCE_COUNT_MAX {
            self.announce_count += 1;
        }

        self.check_health();
    }

    pub fn feed_sync(&mut self, pkt: &SyncPacket, port: PtpPort) {
        self.log_sync_interval = pkt.header.log_message_interval;

        match port {
            PtpPort::Event => {
                self.two_step = pkt.header.is_two_step();
                if self.sync_count < SYNC_COUNT_MAX {
                    self.sync_count += 1;
                }
            }
            PtpPort::General => {
                if self.sync_count2 < SYNC_COUNT_MAX {
                    self.sync_count2 += 1;
                }
            }
        }

        self.check_health();
    }

    pub fn has_valid_source(&self) -> bool {
        self.log_announce_interval != LOG_INTERVAL_UNSET
    }

    pub fn healthy(&self) -> bool {
        self.healthy && self.has_valid_source()
    }

    pub fn port_id(&self) -> &PortId {
        &self.id
    }

    pub fn announce(&self) -> &AnnounceFields {
        &self.announce
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn is_two_step(&self) -> bool {
        self.two_step
    }

    pub fn log_announce_interval(&self) -> i8 {
        self.log_announce_interval
    }

    pub fn log_sync_interval(&self) -> i8 {
        self.log_sync_interval
    }

    /// Runs once per second. Decays the arrival counters at roughly a quarter
    /// of the advertised message rate so they survive ordinary loss but drain
    /// within a few intervals of real silence.
    pub fn housekeeping(&mut self) {
        if !self.has_valid_source() {
            return;
        }

        if Self::maintenance_due(&mut self.maint_counter_announce, self.log_announce_interval) {
            self.announce_count = self.announce_count.saturating_sub(1);
        }

        if Self::maintenance_due(&mut self.maint_counter_sync, self.log_sync_interval) {
            self.sync_count = self.sync_count.saturating_sub(1);
            self.sync_count2 = self.sync_count2.saturating_sub(1);
        }

        self.check_health();
    }

    fn maintenance_due(counter: &mut u8, log_msg_interval: i8) -> bool {
        let interval = (log_msg_interval as i32 + 2).clamp(0, 30);

        *counter = counter.wrapping_add(1);
        if (*counter as i32) >= (1i32 << interval) {
            *counter = 0;
            true
        } else {
            false
        }
    }

    fn check_health(&mut self) {
        let was = self.healthy;

        if self.sync_count == 0 || (self.two_step && self.sync_count2 == 0) {
            self.healthy = false;
        } else if self.announce_count > 3
            && self.sync_count > 6
            && (!self.two_step || self.sync_count2 > 6)
        {
            self.healthy = true;
        }

        if was != self.healthy {
            debug!(
                "{} {} now {}",
                if self.is_master { "master" } else { "candidate" },
                self.id.to_hex_string(),
                if self.healthy { "healthy" } else { "unhealthy" }
            );
        }
    }
}
