//! Kernel Compilation
//!
//! - [`preprocess`]: `#define` injection
//! - [`reflect`]: GLSL front end, validation and interface reflection
//! - [`program`]: pipelines, file loading and hot reload

pub mod preprocess;
pub(crate) mod program;
pub mod reflect;

pub use preprocess::inject_defines;
pub use reflect::{BindingKind, BindingSlot, KernelLayout, UniformBlockLayout, UniformField, UniformType};
