//! Fixed 64-byte frames and reply decoding.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::command::{Command, Status};
use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown command ID 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Malformed payload for command 0x{command:02X}: {reason}")]
    MalformedPayload { command: u8, reason: String },

    #[error("Reply desync: expected echo of 0x{expected:02X}, got 0x{actual:02X}")]
    Desync { expected: u8, actual: u8 },

    #[error("Device answered {command} with status {status}")]
    DeviceStatus { command: Command, status: Status },
}

/// One request or reply frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame([u8; FRAME_SIZE]);

impl Frame {
    pub fn new(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }

    /// Request frame with the command byte set and a zeroed argument block.
    pub fn request(command: Command, args: [u8; ARG_SIZE]) -> Self {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = command.id();
        bytes[1..].copy_from_slice(&args);
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; FRAME_SIZE] = data.try_into().map_err(|_| ProtocolError::MalformedPayload {
            command: data.first().copied().unwrap_or(0),
            reason: format!("frame is {} bytes, expected {}", data.len(), FRAME_SIZE),
        })?;
        Ok(Self(bytes))
    }

    pub fn command_id(&self) -> u8 {
        self.0[0]
    }

    pub fn args(&self) -> &[u8] {
        &self.0[1..]
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame[{:02X} |", self.0[0])?;
        for b in &self.0[1..9] {
            write!(f, " {:02X}", b)?;
        }
        write!(f, " ..]")
    }
}

/// Decoded reply frame.
///
/// Layout: `[echo, status, len0, len1, len2, len3, payload x 58]`. When `data_len`
/// is non-zero, that many raw bytes follow the frame on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub command: Command,
    pub status: Status,
    pub data_len: u32,
    pub payload: [u8; INLINE_PAYLOAD_SIZE],
}

impl Reply {
    pub fn new(command: Command, status: Status) -> Self {
        Self {
            command,
            status,
            data_len: 0,
            payload: [0u8; INLINE_PAYLOAD_SIZE],
        }
    }

    pub fn ok(command: Command) -> Self {
        Self::new(command, Status::Ok)
    }

    /// Copy `bytes` into the inline payload, truncating at its capacity.
    pub fn with_payload(mut self, bytes: &[u8]) -> Self {
        let n = bytes.len().min(INLINE_PAYLOAD_SIZE);
        self.payload[..n].copy_from_slice(&bytes[..n]);
        self
    }

    pub fn with_data_len(mut self, len: u32) -> Self {
        self.data_len = len;
        self
    }

    /// Decode a reply and check it answers `expected`.
    pub fn decode(frame: &Frame, expected: Command) -> Result<Self, ProtocolError> {
        let bytes = frame.as_bytes();
        if bytes[0] != expected.id() {
            return Err(ProtocolError::Desync {
                expected: expected.id(),
                actual: bytes[0],
            });
        }
        let status = Status::from_u8(bytes[1]).ok_or_else(|| ProtocolError::MalformedPayload {
            command: bytes[0],
            reason: format!("unknown status 0x{:02X}", bytes[1]),
        })?;
        let mut payload = [0u8; INLINE_PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[REPLY_HEADER_SIZE..]);
        Ok(Self {
            command: expected,
            status,
            data_len: LittleEndian::read_u32(&bytes[2..6]),
            payload,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = self.command.id();
        bytes[1] = self.status.as_u8();
        LittleEndian::write_u32(&mut bytes[2..6], self.data_len);
        bytes[REPLY_HEADER_SIZE..].copy_from_slice(&self.payload);
        Frame(bytes)
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn payload_u16(&self, offset: usize) -> u16 {
        LittleEndian::read_u16(&self.payload[offset..offset + 2])
    }

    pub fn payload_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.payload[offset..offset + 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_header_layout() {
        let reply = Reply::ok(Command::NorRead)
            .with_data_len(0x0102_0304)
            .with_payload(&[0xAA, 0xBB]);
        let frame = reply.encode();
        let bytes = frame.as_bytes();
        assert_eq!(bytes[0], 0x62);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(&bytes[2..6], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[6..8], &[0xAA, 0xBB]);

        let decoded = Reply::decode(&frame, Command::NorRead).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_reply_echo_mismatch_is_desync() {
        let frame = Reply::ok(Command::Ping).encode();
        let err = Reply::decode(&frame, Command::NorRead).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Desync {
                expected: 0x62,
                actual: 0x01
            }
        );
    }

    #[test]
    fn test_reply_unknown_status_is_malformed() {
        let mut bytes = *Reply::ok(Command::Ping).encode().as_bytes();
        bytes[1] = 0x42;
        let err = Reply::decode(&Frame::new(bytes), Command::Ping).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { command: 0x01, .. }));
    }

    #[test]
    fn test_frame_from_slice_rejects_short_input() {
        assert!(Frame::from_slice(&[0x01; 10]).is_err());
        assert!(Frame::from_slice(&[0x01; FRAME_SIZE]).is_ok());
    }
}
