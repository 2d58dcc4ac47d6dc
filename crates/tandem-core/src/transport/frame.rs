//! Transport frame codec
//!
//! Wire layout, all little-endian:
//!
//! ```text
//! +-------+------+-------+-------------+----------------------+
//! | magic | kind | dtype | len (u32)   | len * width bytes    |
//! | 2     | 1    | 1     | 4           | body                 |
//! +-------+------+-------+-------------+----------------------+
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

use super::{Buffer, DType, Shape};
use crate::{CoreError, Result};

/// Frame magic: "TD"
pub const FRAME_MAGIC: [u8; 2] = [b'T', b'D'];

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 8;

/// Largest element count a frame may carry
pub const MAX_FRAME_ELEMENTS: usize = 1 << 24;

/// What a frame is for; receivers check it against what they expect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    PointToPoint = 1,
    Broadcast = 2,
    /// Connection introduction carrying `[rank, world_size]`
    Hello = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::PointToPoint),
            2 => Ok(FrameKind::Broadcast),
            3 => Ok(FrameKind::Hello),
            other => Err(malformed(format!("unknown frame kind {other}"))),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::PointToPoint => write!(f, "point-to-point"),
            FrameKind::Broadcast => write!(f, "broadcast"),
            FrameKind::Hello => write!(f, "hello"),
        }
    }
}

/// A buffer tagged with its purpose
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub buffer: Buffer,
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub shape: Shape,
}

impl FrameHeader {
    pub fn read_from(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut cursor = Cursor::new(&bytes[..]);
        let magic = [cursor.read_u8()?, cursor.read_u8()?];
        if magic != FRAME_MAGIC {
            return Err(malformed(format!("bad frame magic {magic:?}")));
        }
        let kind = FrameKind::from_u8(cursor.read_u8()?)?;
        let dtype = match cursor.read_u8()? {
            0 => DType::Int64,
            1 => DType::Float32,
            other => return Err(malformed(format!("unknown dtype tag {other}"))),
        };
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        if len > MAX_FRAME_ELEMENTS {
            return Err(malformed(format!(
                "frame of {len} elements exceeds limit {MAX_FRAME_ELEMENTS}"
            )));
        }
        Ok(Self {
            kind,
            shape: Shape { dtype, len },
        })
    }

    /// Number of body bytes following the header
    pub fn body_len(&self) -> usize {
        self.shape.len * self.shape.dtype.width()
    }
}

impl Frame {
    pub fn new(kind: FrameKind, buffer: Buffer) -> Self {
        Self { kind, buffer }
    }

    /// Encode header and body into one contiguous byte vector
    pub fn encode(&self) -> Result<Vec<u8>> {
        let shape = self.buffer.shape();
        if shape.len > MAX_FRAME_ELEMENTS {
            return Err(CoreError::invalid_input(
                "TRANSPORT_FRAME_TOO_LARGE",
                format!("buffer of {} elements exceeds frame limit", shape.len),
                "Encoding transport frame",
                "Lower sync.payload_capacity",
            ));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + shape.len * shape.dtype.width());
        out.extend_from_slice(&FRAME_MAGIC);
        out.write_u8(self.kind as u8)?;
        out.write_u8(match shape.dtype {
            DType::Int64 => 0,
            DType::Float32 => 1,
        })?;
        out.write_u32::<LittleEndian>(shape.len as u32)?;
        match &self.buffer {
            Buffer::Int64(values) => {
                for value in values {
                    out.write_i64::<LittleEndian>(*value)?;
                }
            }
            Buffer::Float32(values) => {
                for value in values {
                    out.write_f32::<LittleEndian>(*value)?;
                }
            }
        }
        Ok(out)
    }

    /// Decode a body that follows `header`
    pub fn decode_body(header: FrameHeader, body: &[u8]) -> Result<Self> {
        if body.len() != header.body_len() {
            return Err(malformed(format!(
                "body of {} bytes does not match header {}",
                body.len(),
                header.shape
            )));
        }
        let mut cursor = Cursor::new(body);
        let buffer = match header.shape.dtype {
            DType::Int64 => {
                let mut values = vec![0i64; header.shape.len];
                cursor.read_i64_into::<LittleEndian>(&mut values)?;
                Buffer::Int64(values)
            }
            DType::Float32 => {
                let mut values = vec![0f32; header.shape.len];
                cursor.read_f32_into::<LittleEndian>(&mut values)?;
                Buffer::Float32(values)
            }
        };
        Ok(Self {
            kind: header.kind,
            buffer,
        })
    }

    /// Overwrite the placeholder `buf` with this frame's buffer, provided
    /// the frame is of the expected kind and matches the placeholder shape.
    pub fn accept_into(self, expected: FrameKind, buf: &mut Buffer) -> Result<()> {
        let declared = buf.shape();
        let found = self.buffer.shape();
        if self.kind != expected || found != declared {
            return Err(CoreError::Desync {
                step: None,
                expected: format!("{expected} {declared}"),
                found: format!("{} {found}", self.kind),
            });
        }
        *buf = self.buffer;
        Ok(())
    }
}

fn malformed(message: String) -> CoreError {
    CoreError::transport("TRANSPORT_MALFORMED_FRAME", message, "Decoding transport frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<Frame> {
        let header: [u8; HEADER_LEN] = bytes[..HEADER_LEN].try_into().unwrap();
        let header = FrameHeader::read_from(&header)?;
        Frame::decode_body(header, &bytes[HEADER_LEN..])
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(FrameKind::Broadcast, Buffer::Int64(vec![7, -1]));
        let bytes = frame.encode().unwrap();

        assert_eq!(&bytes[..2], b"TD");
        assert_eq!(bytes[2], 2);
        assert_eq!(bytes[3], 0);
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &7i64.to_le_bytes());
        assert_eq!(bytes.len(), HEADER_LEN + 16);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_float_body() {
        let frame = Frame::new(FrameKind::PointToPoint, Buffer::Float32(vec![0.25]));
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_rejects_bad_magic_and_oversized_frames() {
        let mut bytes = Frame::new(FrameKind::Broadcast, Buffer::Int64(vec![1]))
            .encode()
            .unwrap();
        bytes[0] = b'X';
        assert_eq!(decode(&bytes).unwrap_err().code(), "TRANSPORT_MALFORMED_FRAME");

        let mut header = [0u8; HEADER_LEN];
        header[..2].copy_from_slice(&FRAME_MAGIC);
        header[2] = 2;
        header[4..8].copy_from_slice(&((MAX_FRAME_ELEMENTS as u32) + 1).to_le_bytes());
        assert!(FrameHeader::read_from(&header).is_err());
    }

    #[test]
    fn test_accept_checks_kind_and_shape() {
        let mut placeholder = Buffer::zeros(Shape::int64(2));
        Frame::new(FrameKind::Broadcast, Buffer::Int64(vec![3, 4]))
            .accept_into(FrameKind::Broadcast, &mut placeholder)
            .unwrap();
        assert_eq!(placeholder, Buffer::Int64(vec![3, 4]));

        let err = Frame::new(FrameKind::PointToPoint, Buffer::Int64(vec![1, 2]))
            .accept_into(FrameKind::Broadcast, &mut placeholder)
            .unwrap_err();
        assert_eq!(err.code(), "SYNC_DESYNC");

        let err = Frame::new(FrameKind::Broadcast, Buffer::Float32(vec![1.0]))
            .accept_into(FrameKind::Broadcast, &mut placeholder)
            .unwrap_err();
        assert!(err.to_string().contains("float32[1]"));
    }
}
