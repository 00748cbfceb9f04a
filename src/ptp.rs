//! PTPv2 (IEEE 1588-2008) wire format: header, sync timestamps and the
//! announce fields that feed best-master selection.
//!
//! All multi-byte scalars are big-endian on the wire. Layouts are the packed
//! ones from the standard; offsets below are absolute byte positions in the
//! datagram.

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;

/// Event messages (Sync) arrive here.
pub const PTP_EVENT_PORT: u16 = 319;
/// General messages (Follow_Up, Announce) arrive here.
pub const PTP_GENERAL_PORT: u16 = 320;
/// IPv4 primary multicast group for PTP.
pub const PTP_PRIMARY_MULTICAST: [u8; 4] = [224, 0, 1, 129];

/// Common header length.
pub const HEADER_LEN: usize = 34;
/// Header + 10-octet origin timestamp. Sync and Follow_Up datagrams must be
/// exactly this long to be dispatched; anything shorter is dropped outright.
pub const SYNC_PACKET_LEN: usize = 44;
/// Header + 30-octet announce body.
pub const ANNOUNCE_PACKET_LEN: usize = 64;

/// Which of the two multicast sockets a datagram came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpPort {
    Event,
    General,
}

impl PtpPort {
    pub fn number(self) -> u16 {
        match self {
            PtpPort::Event => PTP_EVENT_PORT,
            PtpPort::General => PTP_GENERAL_PORT,
        }
    }
}

/// PTP message type, from the low nibble of the first header octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync,
    FollowUp,
    Announce,
    Other(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => MessageType::Sync,
            0x8 => MessageType::FollowUp,
            0xB => MessageType::Announce,
            n => MessageType::Other(n),
        }
    }
}

/// 10-octet port identity: 8-octet clock identity + 16-bit port number.
///
/// Ordering is the raw-byte lexicographic one; an all-zero id is the "no
/// source" placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PortId {
    pub clock_id: [u8; 8],
    pub port_number: u16,
}

impl PortId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 10 {
            return None;
        }
        let mut clock_id = [0u8; 8];
        clock_id.copy_from_slice(&bytes[0..8]);
        Some(PortId {
            clock_id,
            port_number: BigEndian::read_u16(&bytes[8..10]),
        })
    }

    /// Hex rendering for logs, e.g. "001122334455667788/0001".
    pub fn to_hex_string(&self) -> String {
        let mut s = String::with_capacity(22);
        for b in &self.clock_id {
            s.push_str(&format!("{:02x}", b));
        }
        s.push_str(&format!("/{:04x}", self.port_number));
        s
    }
}

/// The announce fields that participate in master selection, in comparison
/// order. Lower is better on every scalar; the grandmaster identity breaks
/// remaining ties with the larger raw id winning.
///
/// `Ord` is arranged so that `Ordering::Less` means "better clock", which
/// makes the all-ones placeholder (`worst()`) sort after every real announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceFields {
    pub priority1: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub priority2: u8,
    pub grandmaster_identity: [u8; 8],
}

impl AnnounceFields {
    /// Placeholder that loses against any real announce.
    pub fn worst() -> Self {
        AnnounceFields {
            priority1: 0xFF,
            clock_class: 0xFF,
            clock_accuracy: 0xFF,
            offset_scaled_log_variance: 0xFFFF,
            priority2: 0xFF,
            grandmaster_identity: [0xFF; 8],
        }
    }
}

impl Ord for AnnounceFields {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority1
            .cmp(&other.priority1)
            .then(self.clock_class.cmp(&other.clock_class))
            .then(self.clock_accuracy.cmp(&other.clock_accuracy))
            .then(
                self.offset_scaled_log_variance
                    .cmp(&other.offset_scaled_log_variance),
            )
            .then(self.priority2.cmp(&other.priority2))
            // larger identity wins the tie, so compare reversed
            .then(other.grandmaster_identity.cmp(&self.grandmaster_identity))
    }
}

impl PartialOrd for AnnounceFields {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 48-bit seconds (16 extra significant bits + 32) and 32-bit nanoseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtpTimestamp {
    pub secs_esb: u16,
    pub secs: u32,
    pub nanos: u32,
}

impl PtpTimestamp {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 10 {
            return None;
        }
        Some(PtpTimestamp {
            secs_esb: BigEndian::read_u16(&bytes[0..2]),
            secs: BigEndian::read_u32(&bytes[2..6]),
            nanos: BigEndian::read_u32(&bytes[6..10]),
        })
    }

    /// Truncated milliseconds, wrapping at 2^32 like the local tick counter.
    pub fn millis32(&self) -> u32 {
        self.secs
            .wrapping_mul(1000)
            .wrapping_add(self.nanos / 1_000_000)
    }

    /// Full milliseconds including the extra significant bits.
    pub fn millis64(&self) -> u64 {
        (((self.secs_esb as u64) << 32) | self.secs as u64) * 1000 + (self.nanos / 1_000_000) as u64
    }
}

/// Common 34-octet message header.
#[derive(Debug, Clone, Copy)]
pub struct PtpHeader {
    pub message_type: MessageType,
    pub version: u8,
    pub msg_len: u16,
    pub domain_number: u8,
    pub flag_field: [u8; 2],
    pub correction_field: i64,
    pub source_port_id: PortId,
    pub sequence_id: u16,
    pub control_field: u8,
    pub log_message_interval: i8,
}

impl PtpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        Some(PtpHeader {
            message_type: MessageType::from(data[0]),
            version: data[1] & 0x0F,
            msg_len: BigEndian::read_u16(&data[2..4]),
            domain_number: data[4],
            flag_field: [data[6], data[7]],
            correction_field: BigEndian::read_i64(&data[8..16]),
            source_port_id: PortId::from_bytes(&data[20..30])?,
            sequence_id: BigEndian::read_u16(&data[30..32]),
            control_field: data[32],
            log_message_interval: data[33] as i8,
        })
    }

    /// Flag bit announcing that the true timestamp follows in a Follow_Up.
    pub fn is_two_step(&self) -> bool {
        self.flag_field[0] & 0x02 != 0
    }
}

/// Sync or Follow_Up: header plus origin timestamp.
#[derive(Debug, Clone, Copy)]
pub struct SyncPacket {
    pub header: PtpHeader,
    pub origin_timestamp: PtpTimestamp,
}

impl SyncPacket {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SYNC_PACKET_LEN {
            return None;
        }
        Some(SyncPacket {
            header: PtpHeader::parse(data)?,
            origin_timestamp: PtpTimestamp::from_bytes(&data[HEADER_LEN..HEADER_LEN + 10])?,
        })
    }
}

/// Announce: header plus the master-selection fields.
///
/// The body also carries an origin timestamp, UTC offset, steps-removed and
/// time-source octets; none of those feed selection here, so they are not
/// retained.
#[derive(Debug, Clone, Copy)]
pub struct AnnouncePacket {
    pub header: PtpHeader,
    pub announce: AnnounceFields,
}

impl AnnouncePacket {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ANNOUNCE_PACKET_LEN {
            return None;
        }
        let header = PtpHeader::parse(data)?;
        // body: originTimestamp(10) currentUtcOffset(2) reserved(1), then the
        // grandmaster block
        let b = &data[HEADER_LEN + 13..];
        let mut grandmaster_identity = [0u8; 8];
        grandmaster_identity.copy_from_slice(&b[6..14]);
        Some(AnnouncePacket {
            header,
            announce: AnnounceFields {
                priority1: b[0],
                clock_class: b[1],
                clock_accuracy: b[2],
                offset_scaled_log_variance: BigEndian::read_u16(&b[3..5]),
                priority2: b[5],
                grandmaster_identity,
            },
        })
    }
}
