//! Wire protocol types for worker, coordinator and monitor communication.
//!
//! Every transport carries the same message shape:
//! - **Shared pipe**: workers -> coordinator (worker stdout)
//! - **FIFO**: coordinator -> monitor
//! - **TCP**: socket workers and monitor <-> coordinator
//!
//! A [`Packet`] always encodes to [`PACKET_SIZE`] bytes: a `u32` tag followed by
//! two 32-bit payload words, all big-endian. Unused payload words are zero.

use std::fmt;

/// Encoded size of every packet, independent of variant.
pub const PACKET_SIZE: usize = 12;

/// Pid carried by `Closed` when the coordinator itself is going away (socket mode).
pub const PID_SERVER: i32 = 0;

/// Pid carried by `Closed` when some worker exited early and its real pid is not tracked.
pub const PID_CLIENT: i32 = 1;

/// Tag enumerator, always the first word on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketTag {
    /// All-zero frame. Never valid on any channel.
    Null = 0,
    Done = 1,
    Closed = 2,
    Kill = 3,
    Range = 4,
    PerfNum = 5,
    Notify = 6,
    Accept = 7,
    Refuse = 8,
}

impl PacketTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Done => "done",
            Self::Closed => "closed",
            Self::Kill => "kill",
            Self::Range => "range",
            Self::PerfNum => "perfnum",
            Self::Notify => "notify",
            Self::Accept => "accept",
            Self::Refuse => "refuse",
        }
    }
}

impl TryFrom<u32> for PacketTag {
    type Error = ProtocolError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::Null,
            1 => Self::Done,
            2 => Self::Closed,
            3 => Self::Kill,
            4 => Self::Range,
            5 => Self::PerfNum,
            6 => Self::Notify,
            7 => Self::Accept,
            8 => Self::Refuse,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

impl fmt::Display for PacketTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// Worker finished its unit (or asks for more work, socket mode).
    /// Coordinator -> monitor: computation finished.
    Done { pid: i32 },

    /// Sender stopped before finishing its work.
    Closed { pid: i32 },

    /// Monitor asks the coordinator to shut down.
    Kill,

    /// Inclusive range assignment, coordinator -> socket worker.
    Range { start: u32, end: u32 },

    /// A value satisfying the predicate.
    PerfNum { value: u32 },

    /// Monitor asks to become the live result subscriber.
    Notify,

    Accept,

    Refuse,
}

/// Errors raised while interpreting a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unrecognized packet tag {0:#04x}")]
    UnknownTag(u32),
    #[error("null packet")]
    Null,
    #[error("packet {0} is not valid on this channel")]
    UnexpectedTag(PacketTag),
}

impl Packet {
    pub fn tag(&self) -> PacketTag {
        match self {
            Self::Done { .. } => PacketTag::Done,
            Self::Closed { .. } => PacketTag::Closed,
            Self::Kill => PacketTag::Kill,
            Self::Range { .. } => PacketTag::Range,
            Self::PerfNum { .. } => PacketTag::PerfNum,
            Self::Notify => PacketTag::Notify,
            Self::Accept => PacketTag::Accept,
            Self::Refuse => PacketTag::Refuse,
        }
    }

    /// Payload words in wire order.
    fn words(&self) -> (u32, u32) {
        match *self {
            Self::Done { pid } | Self::Closed { pid } => (pid as u32, 0),
            Self::Range { start, end } => (start, end),
            Self::PerfNum { value } => (value, 0),
            Self::Kill | Self::Notify | Self::Accept | Self::Refuse => (0, 0),
        }
    }

    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let (a, b) = self.words();
        let mut buf = [0u8; PACKET_SIZE];
        buf[0..4].copy_from_slice(&(self.tag() as u32).to_be_bytes());
        buf[4..8].copy_from_slice(&a.to_be_bytes());
        buf[8..12].copy_from_slice(&b.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; PACKET_SIZE]) -> Result<Self, ProtocolError> {
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let (a, b) = (word(4), word(8));

        Ok(match PacketTag::try_from(word(0))? {
            PacketTag::Null => return Err(ProtocolError::Null),
            PacketTag::Done => Self::Done { pid: a as i32 },
            PacketTag::Closed => Self::Closed { pid: a as i32 },
            PacketTag::Kill => Self::Kill,
            PacketTag::Range => Self::Range { start: a, end: b },
            PacketTag::PerfNum => Self::PerfNum { value: a },
            PacketTag::Notify => Self::Notify,
            PacketTag::Accept => Self::Accept,
            PacketTag::Refuse => Self::Refuse,
        })
    }

    /// Error for a well-formed packet that the receiving side does not accept.
    pub fn unexpected(&self) -> ProtocolError {
        ProtocolError::UnexpectedTag(self.tag())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done { pid } | Self::Closed { pid } => write!(f, "{}(pid={})", self.tag(), pid),
            Self::Range { start, end } => write!(f, "range({}..={})", start, end),
            Self::PerfNum { value } => write!(f, "perfnum({})", value),
            other => f.write_str(other.tag().as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn all_variants() -> Vec<Packet> {
        vec![
            Packet::Done { pid: 4242 },
            Packet::Closed { pid: PID_SERVER },
            Packet::Kill,
            Packet::Range {
                start: 2001,
                end: u32::MAX,
            },
            Packet::PerfNum { value: 8128 },
            Packet::Notify,
            Packet::Accept,
            Packet::Refuse,
        ]
    }

    #[test]
    fn every_variant_survives_the_wire() {
        for packet in all_variants() {
            let bytes = packet.encode();
            assert_eq!(bytes.len(), PACKET_SIZE);
            assert_eq!(Packet::decode(&bytes), Ok(packet), "{packet}");
        }
    }

    #[test]
    fn negative_pid_survives_the_wire() {
        let packet = Packet::Closed { pid: -1 };
        assert_eq!(Packet::decode(&packet.encode()), Ok(packet));
    }

    #[test]
    fn range_wire_bytes() {
        let bytes = Packet::Range {
            start: 1001,
            end: 2000,
        }
        .encode();
        insta::assert_snapshot!(hex(&bytes), @"00000004000003e9000007d0");
    }

    #[test]
    fn closed_server_wire_bytes() {
        let bytes = Packet::Closed { pid: PID_SERVER }.encode();
        insta::assert_snapshot!(hex(&bytes), @"000000020000000000000000");
    }

    #[test]
    fn unit_variants_zero_their_payload() {
        let bytes = Packet::Refuse.encode();
        insta::assert_snapshot!(hex(&bytes), @"000000080000000000000000");
    }

    #[test]
    fn null_frame_is_rejected() {
        assert_eq!(Packet::decode(&[0u8; PACKET_SIZE]), Err(ProtocolError::Null));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[3] = 0x2a;
        assert_eq!(
            Packet::decode(&bytes),
            Err(ProtocolError::UnknownTag(0x2a))
        );
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(Packet::Done { pid: 7 }.to_string(), "done(pid=7)");
        assert_eq!(
            Packet::Range { start: 1, end: 1000 }.to_string(),
            "range(1..=1000)"
        );
        assert_eq!(Packet::Kill.to_string(), "kill");
    }
}
