#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! # Myth Compute
//!
//! A small stateful GPU compute layer on top of `wgpu`: GLSL compute kernels,
//! storage buffers and images, dispatch with automatic barriers, synchronous
//! and async readback, and dispatch timing.
//!
//! Everything hangs off a [`ComputeContext`], which owns the device, every
//! resource and all per-session state (last error, outstanding async read,
//! timer). Independent contexts do not interact.
//!
//! ```rust,ignore
//! use myth_compute::prelude::*;
//!
//! const DOUBLE: &str = r"#version 450
//! layout(local_size_x = 64) in;
//! layout(std430, binding = 0) buffer Data { float values[]; };
//! void main() { values[gl_GlobalInvocationID.x] *= 2.0; }
//! ";
//!
//! let mut ctx = ComputeContext::new();
//! ctx.init(4, 3)?;
//! let program = ctx.compile(DOUBLE)?;
//! let data = ctx.create_buffer_from_slice(&[1.0f32; 256], BufferUsage::Dynamic)?;
//! ctx.bind_buffer(data, 0)?;
//! ctx.set_active_program(program)?;
//! ctx.dispatch_1d(4)?;
//! let doubled: Vec<f32> = ctx.read_buffer_as(data, 256)?;
//! ```

pub mod context;
pub mod dispatch;
pub mod errors;
mod profiler;
mod readback;
pub mod resources;
pub mod settings;
pub mod shader;

pub use context::{ComputeContext, ComputeLimits, DispatchStats, check_version_supported};
pub use dispatch::{BarrierFlags, UniformValue};
pub use errors::{ComputeError, ErrorKind, Result};
pub use resources::{
    BufferHandle, BufferMapping, BufferUsage, ChannelLayout, ComponentType, MapAccess, ProgramHandle,
    TextureDimension, TextureFormat, TextureHandle, TextureInfo,
};
pub use settings::ComputeSettings;
pub use shader::{KernelLayout, inject_defines};

/// Common imports.
pub mod prelude {
    pub use crate::{
        BarrierFlags, BufferHandle, BufferUsage, ComputeContext, ComputeError, ComputeSettings, ErrorKind,
        MapAccess, ProgramHandle, TextureFormat, TextureHandle,
    };
    pub use glam::{Mat4, Vec2, Vec3, Vec4};
}
