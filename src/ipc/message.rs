//! IPC Message - Typed messages and their wire layout
//!
//! A message on the wire is a packed little-endian record:
//!
//! ```text
//! offset  size  field
//!      0     8  total size (header + user data)
//!      8     8  user size (total - 28)
//!     16     8  sender pid
//!     24     4  kind tag
//!     28     n  kind payload, then trailing raw bytes
//! ```
//!
//! Inside the kernel a message is a [`Payload`] (kind plus its fixed fields)
//! and a separately carried byte vector for the trailing data. Lengths are
//! validated when decoding user buffers.

use alloc::vec::Vec;
use thiserror::Error;

use crate::errno::Errno;
use crate::types::{MqId, ProcessId, Uuid};

// ============================================================================
// Wire constants
// ============================================================================

/// Size of the metadata header
pub const HEADER_SIZE: usize = 28;

const OFF_SIZE: usize = 0;
const OFF_USER_SIZE: usize = 8;
const OFF_SENDER: usize = 16;
const OFF_KIND: usize = 24;

pub const MT_INVALID: u32 = 0;
pub const MT_IO: u32 = 1;
pub const MT_SIGNAL: u32 = 2;
pub const MT_HARDWARE_INTERRUPT: u32 = 3;
pub const MT_SERVICE_DISCOVERY: u32 = 4;
/// First tag available to user-defined message kinds
pub const MT_USER_DEFINED: u32 = 1024;

/// Signal sent to a parent when a child process goes away
pub const SIGCHLD: u16 = 17;

const IO_FIXED: usize = 4;
const SIGNAL_FIXED: usize = 2;
const HARDWARE_INTERRUPT_FIXED: usize = 2;
const SERVICE_DISCOVERY_FIXED: usize = 16 + 1 + 8;

// ============================================================================
// Decode errors
// ============================================================================

/// Reasons a user buffer is not a valid message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer of {available} bytes, need {needed}")]
    Truncated { needed: usize, available: usize },
    #[error("declared size {0} smaller than the header")]
    SizeTooSmall(u64),
    #[error("user size {user_size} does not match total size {size}")]
    UserSizeMismatch { size: u64, user_size: u64 },
    #[error("payload of kind {kind} needs {needed} bytes")]
    PayloadTooShort { kind: u32, needed: usize },
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
}

impl From<DecodeError> for Errno {
    fn from(_: DecodeError) -> Self {
        Errno::Inval
    }
}

// ============================================================================
// Kinds and payloads
// ============================================================================

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Invalid,
    Io,
    Signal,
    HardwareInterrupt,
    ServiceDiscovery,
    /// Tag `>= MT_USER_DEFINED`
    User(u32),
}

impl MessageKind {
    pub const fn tag(&self) -> u32 {
        match self {
            MessageKind::Invalid => MT_INVALID,
            MessageKind::Io => MT_IO,
            MessageKind::Signal => MT_SIGNAL,
            MessageKind::HardwareInterrupt => MT_HARDWARE_INTERRUPT,
            MessageKind::ServiceDiscovery => MT_SERVICE_DISCOVERY,
            MessageKind::User(tag) => *tag,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self, DecodeError> {
        Ok(match tag {
            MT_INVALID => MessageKind::Invalid,
            MT_IO => MessageKind::Io,
            MT_SIGNAL => MessageKind::Signal,
            MT_HARDWARE_INTERRUPT => MessageKind::HardwareInterrupt,
            MT_SERVICE_DISCOVERY => MessageKind::ServiceDiscovery,
            t if t >= MT_USER_DEFINED => MessageKind::User(t),
            t => return Err(DecodeError::UnknownKind(t)),
        })
    }

    /// Bytes of fixed payload following the header
    pub const fn fixed_size(&self) -> usize {
        match self {
            MessageKind::Invalid | MessageKind::User(_) => 0,
            MessageKind::Io => IO_FIXED,
            MessageKind::Signal => SIGNAL_FIXED,
            MessageKind::HardwareInterrupt => HARDWARE_INTERRUPT_FIXED,
            MessageKind::ServiceDiscovery => SERVICE_DISCOVERY_FIXED,
        }
    }
}

/// Fixed, kind-specific part of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Only the size is meaningful
    Invalid,
    /// Data for a file descriptor
    Io { fd: i32 },
    Signal { signal: u16 },
    HardwareInterrupt { interrupt: u16 },
    /// Service lookup or its answer; `mq` is the queue to reply to
    ServiceDiscovery {
        service: Uuid,
        response: bool,
        mq: MqId,
    },
    /// User-defined kind, tag `>= MT_USER_DEFINED`
    User { kind: u32 },
}

impl Payload {
    pub const fn kind(&self) -> MessageKind {
        match self {
            Payload::Invalid => MessageKind::Invalid,
            Payload::Io { .. } => MessageKind::Io,
            Payload::Signal { .. } => MessageKind::Signal,
            Payload::HardwareInterrupt { .. } => MessageKind::HardwareInterrupt,
            Payload::ServiceDiscovery { .. } => MessageKind::ServiceDiscovery,
            Payload::User { kind } => MessageKind::User(*kind),
        }
    }

    fn write(&self, out: &mut [u8]) {
        match self {
            Payload::Invalid | Payload::User { .. } => {}
            Payload::Io { fd } => out[..4].copy_from_slice(&fd.to_le_bytes()),
            Payload::Signal { signal } => out[..2].copy_from_slice(&signal.to_le_bytes()),
            Payload::HardwareInterrupt { interrupt } => {
                out[..2].copy_from_slice(&interrupt.to_le_bytes())
            }
            Payload::ServiceDiscovery {
                service,
                response,
                mq,
            } => {
                out[..16].copy_from_slice(service.as_bytes());
                out[16] = *response as u8;
                out[17..25].copy_from_slice(&mq.raw().to_le_bytes());
            }
        }
    }

    fn read(kind: MessageKind, bytes: &[u8]) -> Self {
        match kind {
            MessageKind::Invalid => Payload::Invalid,
            MessageKind::User(kind) => Payload::User { kind },
            MessageKind::Io => Payload::Io {
                fd: i32::from_le_bytes(le_array(&bytes[..4])),
            },
            MessageKind::Signal => Payload::Signal {
                signal: u16::from_le_bytes(le_array(&bytes[..2])),
            },
            MessageKind::HardwareInterrupt => Payload::HardwareInterrupt {
                interrupt: u16::from_le_bytes(le_array(&bytes[..2])),
            },
            MessageKind::ServiceDiscovery => Payload::ServiceDiscovery {
                service: Uuid::from_bytes(le_array(&bytes[..16])),
                response: bytes[16] != 0,
                mq: MqId::from_raw(u64::from_le_bytes(le_array(&bytes[17..25]))),
            },
        }
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

// ============================================================================
// Message
// ============================================================================

/// A kernel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sending process, stamped by the kernel on send
    pub sender: ProcessId,
    pub payload: Payload,
    /// Trailing raw bytes after the fixed payload
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(payload: Payload, data: Vec<u8>) -> Self {
        Self {
            sender: ProcessId::INVALID,
            payload,
            data,
        }
    }

    /// User-defined message; `kind` must be `>= MT_USER_DEFINED`
    pub fn user(kind: u32, raw: Vec<u8>) -> Result<Self, Errno> {
        if kind < MT_USER_DEFINED {
            return Err(Errno::Inval);
        }
        Ok(Self::new(Payload::User { kind }, raw))
    }

    pub fn signal(signal: u16) -> Self {
        Self::new(Payload::Signal { signal }, Vec::new())
    }

    pub fn hardware_interrupt(interrupt: u16) -> Self {
        Self::new(Payload::HardwareInterrupt { interrupt }, Vec::new())
    }

    pub fn io(fd: i32, data: Vec<u8>) -> Self {
        Self::new(Payload::Io { fd }, data)
    }

    pub fn service_discovery(service: Uuid, response: bool, mq: MqId, data: Vec<u8>) -> Self {
        Self::new(
            Payload::ServiceDiscovery {
                service,
                response,
                mq,
            },
            data,
        )
    }

    pub fn with_sender(mut self, sender: ProcessId) -> Self {
        self.sender = sender;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Total encoded size, header included
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.user_size()
    }

    /// Bytes after the header
    pub fn user_size(&self) -> usize {
        self.kind().fixed_size() + self.data.len()
    }

    /// Encode into `buf`; `EMSGSIZE` if it does not fit. Returns the size.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let size = self.size();
        if buf.len() < size {
            return Err(Errno::MsgSize);
        }

        buf[OFF_SIZE..OFF_SIZE + 8].copy_from_slice(&(size as u64).to_le_bytes());
        buf[OFF_USER_SIZE..OFF_USER_SIZE + 8]
            .copy_from_slice(&(self.user_size() as u64).to_le_bytes());
        buf[OFF_SENDER..OFF_SENDER + 8].copy_from_slice(&self.sender.0.to_le_bytes());
        buf[OFF_KIND..OFF_KIND + 4].copy_from_slice(&self.kind().tag().to_le_bytes());

        let fixed = self.kind().fixed_size();
        self.payload.write(&mut buf[HEADER_SIZE..HEADER_SIZE + fixed]);
        buf[HEADER_SIZE + fixed..size].copy_from_slice(&self.data);

        Ok(size)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; self.size()];
        // Buffer is sized exactly
        let _ = self.encode_into(&mut buf);
        buf
    }

    /// Decode and validate a message from a user buffer. Bytes beyond the
    /// declared size are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }

        let size = read_u64(buf, OFF_SIZE);
        let user_size = read_u64(buf, OFF_USER_SIZE);
        let sender = ProcessId(read_u64(buf, OFF_SENDER));
        let tag = u32::from_le_bytes(le_array(&buf[OFF_KIND..OFF_KIND + 4]));

        if size < HEADER_SIZE as u64 {
            return Err(DecodeError::SizeTooSmall(size));
        }
        if size > buf.len() as u64 {
            return Err(DecodeError::Truncated {
                needed: usize::try_from(size).unwrap_or(usize::MAX),
                available: buf.len(),
            });
        }
        if user_size != size - HEADER_SIZE as u64 {
            return Err(DecodeError::UserSizeMismatch { size, user_size });
        }

        let size = size as usize;
        let kind = MessageKind::from_tag(tag)?;
        let fixed = kind.fixed_size();
        if (user_size as usize) < fixed {
            return Err(DecodeError::PayloadTooShort {
                kind: tag,
                needed: fixed,
            });
        }

        let payload = Payload::read(kind, &buf[HEADER_SIZE..HEADER_SIZE + fixed]);
        let data = buf[HEADER_SIZE + fixed..size].to_vec();

        Ok(Self {
            sender,
            payload,
            data,
        })
    }
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(le_array(&buf[off..off + 8]))
}

// ============================================================================
// Receive buffer protocol
// ============================================================================

/// Capacity a receive buffer declares in its size field
///
/// The declared capacity may not exceed the real buffer; buffers shorter
/// than the header cannot take part in size negotiation.
pub fn buffer_capacity(buf: &[u8]) -> Result<usize, Errno> {
    if buf.len() < HEADER_SIZE {
        return Err(Errno::Inval);
    }
    let declared = read_u64(buf, OFF_SIZE);
    if declared > buf.len() as u64 {
        return Err(Errno::Inval);
    }
    Ok(declared as usize)
}

/// Tell the caller how large its buffer has to be: write `size` into the
/// size field and mark the buffer `MT_INVALID`.
pub fn report_required_size(buf: &mut [u8], size: usize) {
    if buf.len() >= HEADER_SIZE {
        buf[OFF_SIZE..OFF_SIZE + 8].copy_from_slice(&(size as u64).to_le_bytes());
        buf[OFF_KIND..OFF_KIND + 4].copy_from_slice(&MT_INVALID.to_le_bytes());
    }
}

/// Prepare an empty receive buffer of `capacity` bytes
pub fn receive_buffer(capacity: usize) -> Vec<u8> {
    let mut buf = alloc::vec![0u8; capacity.max(HEADER_SIZE)];
    buf[OFF_SIZE..OFF_SIZE + 8].copy_from_slice(&(capacity as u64).to_le_bytes());
    buf
}

/// Size field of a buffer
pub fn declared_size(buf: &[u8]) -> Option<u64> {
    (buf.len() >= 8).then(|| read_u64(buf, OFF_SIZE))
}

/// Kind tag of a buffer
pub fn declared_kind(buf: &[u8]) -> Option<u32> {
    (buf.len() >= HEADER_SIZE).then(|| u32::from_le_bytes(le_array(&buf[OFF_KIND..OFF_KIND + 4])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_header_layout() {
        let msg = Message::user(MT_USER_DEFINED, vec![0xAB])
            .unwrap()
            .with_sender(ProcessId(0x1337));
        let buf = msg.encode();

        assert_eq!(buf.len(), HEADER_SIZE + 1);
        assert_eq!(&buf[0..8], &29u64.to_le_bytes());
        assert_eq!(&buf[8..16], &1u64.to_le_bytes());
        assert_eq!(&buf[16..24], &0x1337u64.to_le_bytes());
        assert_eq!(&buf[24..28], &1024u32.to_le_bytes());
        assert_eq!(buf[28], 0xAB);
    }

    #[test]
    fn test_service_discovery_layout() {
        let service = Uuid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        let msg = Message::service_discovery(service, true, MqId::from_raw(5), vec![1, 2]);
        let buf = msg.encode();

        assert_eq!(msg.user_size(), 25 + 2);
        assert_eq!(&buf[28..44], service.as_bytes());
        assert_eq!(buf[44], 1);
        assert_eq!(&buf[45..53], &5u64.to_le_bytes());
        assert_eq!(&buf[53..55], &[1, 2]);

        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn test_decode_ignores_slack() {
        let msg = Message::signal(SIGCHLD);
        let mut buf = msg.encode();
        buf.extend_from_slice(&[0xFF; 16]);
        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        let mut buf = Message::io(3, vec![9, 9, 9]).encode();

        assert!(matches!(
            Message::decode(&buf[..10]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            Message::decode(&buf[..buf.len() - 1]),
            Err(DecodeError::Truncated { .. })
        ));

        buf[8] = 0;
        assert!(matches!(
            Message::decode(&buf),
            Err(DecodeError::UserSizeMismatch { .. })
        ));

        buf[0..8].copy_from_slice(&4u64.to_le_bytes());
        assert_eq!(Message::decode(&buf), Err(DecodeError::SizeTooSmall(4)));
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        let mut buf = vec![0u8; HEADER_SIZE + 1];
        buf[0..8].copy_from_slice(&(HEADER_SIZE as u64 + 1).to_le_bytes());
        buf[8..16].copy_from_slice(&1u64.to_le_bytes());
        buf[24..28].copy_from_slice(&MT_SIGNAL.to_le_bytes());

        assert_eq!(
            Message::decode(&buf),
            Err(DecodeError::PayloadTooShort {
                kind: MT_SIGNAL,
                needed: 2
            })
        );
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = Message::signal(1).encode();
        buf[24..28].copy_from_slice(&77u32.to_le_bytes());
        assert_eq!(Message::decode(&buf), Err(DecodeError::UnknownKind(77)));
        assert_eq!(Errno::from(DecodeError::UnknownKind(77)), Errno::Inval);
    }

    #[test]
    fn test_user_kind_range() {
        assert_eq!(Message::user(5, vec![]), Err(Errno::Inval));
        assert_eq!(
            Message::user(4096, vec![]).unwrap().kind(),
            MessageKind::User(4096)
        );
    }

    #[test]
    fn test_encode_into_small_buffer() {
        let msg = Message::hardware_interrupt(4);
        let mut buf = [0u8; HEADER_SIZE];
        assert_eq!(msg.encode_into(&mut buf), Err(Errno::MsgSize));
    }

    #[test]
    fn test_receive_buffer_protocol() {
        let mut buf = receive_buffer(HEADER_SIZE);
        assert_eq!(buffer_capacity(&buf), Ok(HEADER_SIZE));

        report_required_size(&mut buf, 64);
        assert_eq!(declared_size(&buf), Some(64));
        assert_eq!(declared_kind(&buf), Some(MT_INVALID));
        // Declared size now exceeds the real buffer
        assert_eq!(buffer_capacity(&buf), Err(Errno::Inval));

        assert_eq!(buffer_capacity(&[0u8; 4]), Err(Errno::Inval));
    }
}
