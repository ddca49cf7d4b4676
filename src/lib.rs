//! lmrt_tensor provides the multi-dimensional array ("tensor") representation
//! underlying the lmrt on-device inference runtime.
//!
//! # Storage and ownership
//!
//! Tensors live in a [`TensorArena`] and are addressed by [`TensorId`]. Each
//! tensor is exactly one of:
//!
//! - A standalone *owner* of an aligned host buffer, allocated through the
//!   arena's [`Alloc`] backend and released exactly once.
//! - A *child view* of a master tensor, aliasing the master's buffer with an
//!   optional per-axis offset. Offsets wrap modulo the master's extents,
//!   which gives broadcast/repeat addressing (eg. repeating a key/value head
//!   across a wider query head count).
//! - An *aggregate*, a zero-copy logical concatenation of independently
//!   owned or viewed tensors along one axis.
//!
//! # Layout
//!
//! A tensor's axes have a fixed logical meaning — (batch, head, sequence,
//! dimension) for transformer data, (batch, channel, time, height, width)
//! for vision data — while a [`LayoutTag`] fixes their physical order in
//! memory. Transposing is a metadata rewrite: the tag changes, logical
//! accessors keep reporting the same extents, and no data moves.
//!
//! ```
//! use lmrt_tensor::{Axis, DataType, LayoutTag, TensorArena};
//!
//! let mut arena = TensorArena::new();
//! let t = arena.create(2, 3, 4, 5);
//! arena.alloc(t, DataType::F32);
//! arena.set::<f32>(t, 1, 2, 3, 4, 0.5);
//! assert_eq!(arena.get::<f32>(t, 1, 2, 3, 4), 0.5);
//!
//! arena.trans_layout(t, Axis::Sequence, Axis::Dimension, false).unwrap();
//! assert_eq!(arena.layout_tag(t), LayoutTag::Bhds);
//! assert_eq!(arena.sequence(t), 4); // logical extents are unchanged
//! ```

pub mod errors;
pub mod layout;
pub mod storage;

mod dtype;
mod tensor;

// Re-exports for convenience.
pub use dtype::{DataType, Element};
pub use errors::UnsupportedTransform;
pub use layout::{Axis, LayoutTag};
pub use storage::{Alloc, HostBuffer, SystemAlloc};
pub use tensor::{JoinAxis, TensorArena, TensorId};
