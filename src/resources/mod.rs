//! Device Resources
//!
//! Buffers and storage images owned by a [`ComputeContext`](crate::ComputeContext):
//! - [`buffer`]: fixed-size linear memory with a usage hint
//! - [`texture`]: 2D / 3D read-write images
//! - [`format`]: the fixed texel format table
//! - [`binding`]: slot and unit tables consulted at dispatch
//!
//! Resources are addressed through generational handles. The `Default` value
//! of every handle type is the null handle; a handle whose resource was
//! destroyed never resolves again, even if its slot is reused.

pub mod binding;
pub mod buffer;
pub mod format;
pub mod texture;

pub use binding::BindingTable;
pub use buffer::{BufferMapping, BufferUsage, MapAccess};
pub use format::{ChannelLayout, ComponentType, TextureFormat};
pub use texture::{TextureDimension, TextureInfo};

use slotmap::new_key_type;

new_key_type! {
    /// Handle to a device buffer.
    pub struct BufferHandle;
    /// Handle to a storage image.
    pub struct TextureHandle;
    /// Handle to a compiled compute program.
    pub struct ProgramHandle;
}

/// Copy granularity of buffer transfers.
pub(crate) const COPY_ALIGNMENT: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

/// Rounds `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub(crate) const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub(crate) const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}
