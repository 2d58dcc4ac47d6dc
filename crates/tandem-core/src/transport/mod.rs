//! Process-group transport
//!
//! A fixed set of ranks exchanging shape-declared buffers through blocking,
//! ordered collective broadcasts and point-to-point messages. Rank 0 is the
//! primary.

pub mod frame;
pub mod local;
pub mod tcp;

use async_trait::async_trait;
use std::fmt;

use crate::Result;

pub use frame::{Frame, FrameKind};
pub use local::{LocalGroup, LocalTransport};
pub use tcp::{PendingPrimary, TcpTransport};

/// Index of a process in the pool
pub type Rank = usize;

/// The rank that receives external requests and originates every broadcast
pub const PRIMARY_RANK: Rank = 0;

/// Element type of a transport buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Int64,
    Float32,
}

impl DType {
    /// Size of one element on the wire
    pub fn width(&self) -> usize {
        match self {
            DType::Int64 => 8,
            DType::Float32 => 4,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Int64 => write!(f, "int64"),
            DType::Float32 => write!(f, "float32"),
        }
    }
}

/// Declared shape of a buffer: element type and length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub dtype: DType,
    pub len: usize,
}

impl Shape {
    pub const fn int64(len: usize) -> Self {
        Self {
            dtype: DType::Int64,
            len,
        }
    }

    pub const fn float32(len: usize) -> Self {
        Self {
            dtype: DType::Float32,
            len,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.dtype, self.len)
    }
}

/// Fixed-shape numeric buffer exchanged between ranks
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Int64(Vec<i64>),
    Float32(Vec<f32>),
}

impl Buffer {
    /// A zero-filled placeholder of the given shape
    pub fn zeros(shape: Shape) -> Self {
        match shape.dtype {
            DType::Int64 => Buffer::Int64(vec![0; shape.len]),
            DType::Float32 => Buffer::Float32(vec![0.0; shape.len]),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Buffer::Int64(values) => Shape::int64(values.len()),
            Buffer::Float32(values) => Shape::float32(values.len()),
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            Buffer::Int64(values) => Some(values),
            Buffer::Float32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Buffer::Float32(values) => Some(values),
            Buffer::Int64(_) => None,
        }
    }
}

/// Collective and point-to-point primitives over a fixed pool of ranks.
///
/// Every call blocks the caller until the operation completes locally. All
/// ranks must issue collective calls in the same order with the same
/// declared shapes; a frame whose kind or shape differs from what the
/// receiver declared fails with [`crate::CoreError::Desync`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// This process's rank
    fn rank(&self) -> Rank;

    /// Number of ranks in the pool
    fn world_size(&self) -> usize;

    /// Deliver `buf` from `root` to every rank. On `root` the buffer is the
    /// value sent; elsewhere it is a placeholder overwritten on return.
    async fn broadcast(&self, buf: &mut Buffer, root: Rank) -> Result<()>;

    /// Send `buf` to `dst`
    async fn send(&self, buf: &Buffer, dst: Rank) -> Result<()>;

    /// Receive a point-to-point message from `src` into the placeholder `buf`
    async fn recv(&self, buf: &mut Buffer, src: Rank) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_shapes() {
        let buf = Buffer::zeros(Shape::int64(4));
        assert_eq!(buf.shape(), Shape::int64(4));
        assert_eq!(buf.as_i64(), Some(&[0i64, 0, 0, 0][..]));
        assert!(buf.as_f32().is_none());

        let buf = Buffer::Float32(vec![0.5]);
        assert_eq!(buf.shape().to_string(), "float32[1]");
    }
}
