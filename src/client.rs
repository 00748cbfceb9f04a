//! The slave-only PTP client.
//!
//! Owns the two multicast sockets (through the [`PtpNetwork`] seam), two
//! trackers (the flagged current master and one candidate) and the
//! [`SyncManager`]. The host drives [`PtpClient::poll`] in its own loop;
//! every state transition happens inside `poll`, so the whole thing is
//! single-threaded cooperative.
//!
//! Master selection is a reduced form of the 1588 best-master algorithm: an
//! unknown source only displaces the tracked candidate if its announce beats
//! the candidate's, and the candidate only displaces the master once it is
//! demonstrably alive (healthy) and either beats the master's announce or the
//! master has gone stale.

use crate::ptp::{
    AnnouncePacket, MessageType, PtpHeader, PtpPort, SyncPacket, ANNOUNCE_PACKET_LEN,
    SYNC_PACKET_LEN,
};
use crate::status::SyncStatus;
use crate::sync::SyncManager;
use crate::tracker::Tracker;
use crate::traits::{MillisClock, PtpNetwork};
use anyhow::Result;
use log::{debug, info, warn};
use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

const MAINTENANCE_INTERVAL_MS: u32 = 1000;
const PACKET_BUF_LEN: usize = 256;

pub struct PtpClient<C: MillisClock, N: PtpNetwork> {
    clock: C,
    network: N,

    master: Tracker,
    candidate: Tracker,
    sync: SyncManager,

    domain: u8,
    started: bool,
    maintenance_ts: u32,

    pps_counter: u16,
    last_pps_count: u16,

    ever_locked: Cell<bool>,

    buf: [u8; PACKET_BUF_LEN],
}

impl<C: MillisClock, N: PtpNetwork> PtpClient<C, N> {
    pub fn new(clock: C, network: N) -> Self {
        PtpClient {
            clock,
            network,
            master: Tracker::new(true),
            candidate: Tracker::new(false),
            sync: SyncManager::new(),
            domain: 0,
            started: false,
            maintenance_ts: 0,
            pps_counter: 0,
            last_pps_count: 0,
            ever_locked: Cell::new(false),
            buf: [0u8; PACKET_BUF_LEN],
        }
    }

    /// Select which PTP domain to listen to. Defaults to 0.
    pub fn set_domain(&mut self, domain: u8) {
        self.domain = domain;
    }

    /// Join the multicast group on both ports. On failure both sockets are
    /// released and existing state is untouched; calling again later is fine.
    pub fn begin(&mut self) -> bool {
        let now = self.clock.millis();
        self.sync.reset(now);

        match self.network.open() {
            Ok(()) => {
                self.maintenance_ts = now;
                self.started = true;
                info!("joined PTP multicast group (domain {})", self.domain);
                true
            }
            Err(e) => {
                warn!("multicast join failed: {:#}", e);
                self.network.close();
                false
            }
        }
    }

    /// Release the sockets and clear all tracking state. `begin` may be
    /// called again afterwards.
    pub fn quit(&mut self) {
        self.network.close();
        self.master.reset();
        self.candidate.reset();
        self.sync.reset(self.clock.millis());
        self.started = false;
    }

    /// Drain at most one datagram per port, dispatch it, and run the 1 Hz
    /// maintenance when due. Call this frequently.
    pub fn poll(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        for port in [PtpPort::Event, PtpPort::General] {
            let len = match self.network.recv(port, &mut self.buf)? {
                Some(len) => len,
                None => continue,
            };
            if len < SYNC_PACKET_LEN {
                continue;
            }

            self.pps_counter = self.pps_counter.wrapping_add(1);

            let header = match PtpHeader::parse(&self.buf[..len]) {
                Some(h) => h,
                None => continue,
            };

            if header.domain_number != self.domain {
                // Traffic from a foreign domain means mixed networks or a
                // misconfigured filter; bail out of this cycle rather than
                // keep reading from it. Maintenance waits for the next call.
                debug!(
                    "dropping packet for domain {} (ours is {})",
                    header.domain_number, self.domain
                );
                return Ok(());
            }

            match header.message_type {
                MessageType::Announce
                    if port == PtpPort::General && len == ANNOUNCE_PACKET_LEN =>
                {
                    if let Some(pkt) = AnnouncePacket::parse(&self.buf[..len]) {
                        self.dispatch_announce(&pkt);
                    }
                }
                MessageType::Sync | MessageType::FollowUp if len == SYNC_PACKET_LEN => {
                    if let Some(pkt) = SyncPacket::parse(&self.buf[..len]) {
                        self.dispatch_sync(&pkt, port);
                    }
                }
                _ => {}
            }
        }

        let now = self.clock.millis();
        if now.wrapping_sub(self.maintenance_ts) >= MAINTENANCE_INTERVAL_MS {
            self.maintenance_ts = now;
            self.maintenance(now);
        }

        Ok(())
    }

    fn dispatch_announce(&mut self, pkt: &AnnouncePacket) {
        if !self.master.has_valid_source() {
            // no master at all yet: take whatever announces first
            info!(
                "adopting master {}",
                pkt.header.source_port_id.to_hex_string()
            );
            self.master.start(pkt);
        } else if pkt.header.source_port_id == *self.master.port_id() {
            self.master.feed_announce(pkt);
        } else if pkt.header.source_port_id == *self.candidate.port_id() {
            self.candidate.feed_announce(pkt);

            let candidate_wins = self.candidate.announce() < self.master.announce();
            if (self.candidate.healthy() && candidate_wins)
                || (!self.master.healthy() && self.candidate.healthy())
            {
                info!(
                    "promoting candidate {} to master",
                    self.candidate.port_id().to_hex_string()
                );
                self.master.take(&mut self.candidate);
            }
        } else if pkt.announce < *self.candidate.announce() {
            debug!(
                "tracking candidate {}",
                pkt.header.source_port_id.to_hex_string()
            );
            self.candidate.start(pkt);
        }
    }

    fn dispatch_sync(&mut self, pkt: &SyncPacket, port: PtpPort) {
        if pkt.header.source_port_id == *self.master.port_id() {
            self.master.feed_sync(pkt, port);
            let now = self.clock.millis();
            self.sync.feed_sync(pkt, port, now);
            if self.sync.lock_status() {
                self.ever_locked.set(true);
            }
        } else if pkt.header.source_port_id == *self.candidate.port_id() {
            self.candidate.feed_sync(pkt, port);
        }
    }

    fn maintenance(&mut self, now: u32) {
        self.last_pps_count = self.pps_counter;
        self.pps_counter = 0;

        self.master.housekeeping();
        self.candidate.housekeeping();
        self.sync.housekeeping(now);
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Disciplined 32-bit milliseconds (backward-jump suppressed).
    pub fn millis(&self) -> u32 {
        self.sync.millis(self.clock.millis())
    }

    /// Disciplined 64-bit epoch milliseconds.
    pub fn epoch_millis64(&self) -> u64 {
        self.sync.epoch_millis64(self.clock.millis())
    }

    pub fn lock_status(&self) -> bool {
        self.sync.lock_status()
    }

    /// True once the client has ever been locked since construction.
    pub fn ever_locked(&self) -> bool {
        if self.ever_locked.get() {
            return true;
        }
        if self.sync.lock_status() {
            self.ever_locked.set(true);
            return true;
        }
        false
    }

    /// True if the master carries a real wall-clock epoch.
    pub fn epoch_valid(&self) -> bool {
        self.sync.epoch_valid()
    }

    /// Most recent peak diff between our time and the master's, in ms.
    pub fn last_diff_ms(&self) -> i16 {
        self.sync.last_diff_ms()
    }

    /// Raw packets seen per second, from the previous maintenance window.
    pub fn raw_pps(&self) -> u16 {
        self.last_pps_count
    }

    pub fn master(&self) -> &Tracker {
        &self.master
    }

    pub fn candidate(&self) -> &Tracker {
        &self.candidate
    }

    /// One-line state summary: "OK (Nms)" when locked, "not OK" when only
    /// the epoch is valid, "NOT OK" otherwise.
    pub fn short_status(&self) -> String {
        if self.lock_status() {
            format!("OK ({}ms)", self.last_diff_ms())
        } else if self.epoch_valid() {
            "not OK".to_string()
        } else {
            "NOT OK".to_string()
        }
    }

    /// Full snapshot for host display or a status file.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            locked: self.lock_status(),
            ever_locked: self.ever_locked(),
            epoch_valid: self.epoch_valid(),
            last_diff_ms: self.last_diff_ms(),
            raw_pps: self.raw_pps(),
            epoch_millis: self.epoch_millis64(),
            summary: self.short_status(),
            updated_ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockMillisClock, MockPtpNetwork};
    use anyhow::anyhow;

    #[test]
    fn begin_releases_sockets_when_join_fails() {
        let mut clock = MockMillisClock::new();
        clock.expect_millis().return_const(0u32);

        let mut net = MockPtpNetwork::new();
        net.expect_open()
            .times(1)
            .returning(|| Err(anyhow!("join failed")));
        net.expect_close().times(1).return_const(());

        let mut client = PtpClient::new(clock, net);
        assert!(!client.begin());
    }

    #[test]
    fn begin_then_quit_releases_and_resets() {
        let mut clock = MockMillisClock::new();
        clock.expect_millis().return_const(0u32);

        let mut net = MockPtpNetwork::new();
        net.expect_open().times(1).returning(|| Ok(()));
        net.expect_close().times(1).return_const(());

        let mut client = PtpClient::new(clock, net);
        assert!(client.begin());
        client.quit();

        assert!(!client.master().has_valid_source());
        assert!(!client.candidate().has_valid_source());
        assert!(!client.lock_status());
    }

    #[test]
    fn short_packets_are_ignored() {
        let mut clock = MockMillisClock::new();
        clock.expect_millis().return_const(0u32);

        let mut net = MockPtpNetwork::new();
        net.expect_open().returning(|| Ok(()));
        net.expect_recv().returning(|_, buf| {
            buf[0] = 0x0B;
            Ok(Some(10))
        });

        let mut client = PtpClient::new(clock, net);
        assert!(client.begin());
        client.poll().unwrap();
        assert!(!client.master().has_valid_source());
        assert_eq!(client.raw_pps(), 0);
    }

    #[test]
    fn status_summary_without_any_master() {
        let mut clock = MockMillisClock::new();
        clock.expect_millis().return_const(0u32);
        let net = MockPtpNetwork::new();

        let client = PtpClient::new(clock, net);
        assert_eq!(client.short_status(), "NOT OK");
        assert!(!client.ever_locked());

        let status = client.status();
        assert!(!status.locked);
        assert_eq!(status.summary, "NOT OK");
    }
}
