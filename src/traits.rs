use crate::ptp::PtpPort;
use anyhow::Result;

/// Monotonic millisecond tick source. Wraps at 2^32 (about 49.7 days); all
/// consumers compare instants as signed differences, never with `<`/`>` on
/// the raw values.
#[cfg_attr(test, mockall::automock)]
pub trait MillisClock {
    fn millis(&self) -> u32;
}

/// The two multicast sockets, behind a seam so tests can script traffic.
#[cfg_attr(test, mockall::automock)]
pub trait PtpNetwork {
    /// Join the PTP multicast group on both ports.
    fn open(&mut self) -> Result<()>;

    /// Release both sockets. Safe to call when already closed.
    fn close(&mut self);

    /// Pull at most one datagram from the given port into `buf`.
    /// Returns Ok(None) when nothing is pending (would-block) or the socket
    /// is closed.
    fn recv(&mut self, port: PtpPort, buf: &mut [u8]) -> Result<Option<usize>>;
}
