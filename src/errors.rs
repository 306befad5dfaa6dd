//! Error Types
//!
//! This module defines the error types used throughout the compute layer.
//!
//! # Overview
//!
//! The main error type [`ComputeError`] covers all failure modes including:
//! - Device and context negotiation failures
//! - Kernel compilation and interface validation errors
//! - Resource management errors (stale handles, bad sizes, out-of-bounds writes)
//! - Host/device synchronization failures
//!
//! Every variant belongs to exactly one [`ErrorKind`], which is the coarse
//! classification callers usually branch on.
//!
//! # Usage
//!
//! All public APIs return [`Result<T>`] which is an alias for
//! `std::result::Result<T, ComputeError>`. The owning
//! [`ComputeContext`](crate::ComputeContext) additionally keeps the message of
//! the most recent failure in its last-error slot.
//!
//! ```rust,ignore
//! use myth_compute::{ComputeContext, ErrorKind};
//!
//! let mut ctx = ComputeContext::new();
//! if let Err(err) = ctx.compile("not a shader") {
//!     assert_eq!(err.kind(), ErrorKind::Compile);
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a [`ComputeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Device/context negotiation failed.
    Init,
    /// The kernel source did not parse.
    Compile,
    /// The kernel parsed but its interface could not be validated or linked.
    Link,
    /// A shader file could not be read.
    Io,
    /// Invalid handle, size, binding or uniform type.
    Resource,
    /// A write or read would exceed a buffer allocation.
    Bounds,
    /// A fence wait ran out of time.
    SyncTimeout,
    /// A fence wait or mapping failed irrecoverably.
    SyncFailure,
    /// The timer was used out of order.
    TimerMisuse,
    /// The operation is not valid in the context's current lifecycle state.
    State,
}

/// The main error type for the compute layer.
#[derive(Error, Debug)]
pub enum ComputeError {
    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Failed to request a compatible GPU adapter.
    #[error("Failed to request WGPU adapter: {0}")]
    AdapterRequestFailed(String),

    /// Failed to create the GPU device.
    #[error("Failed to create WGPU device: {0}")]
    DeviceCreateFailed(#[from] wgpu::RequestDeviceError),

    /// The adapter cannot provide the requested capability version.
    #[error("Compute version {major}.{minor} is not supported: {reason}")]
    UnsupportedVersion {
        /// Requested major version
        major: u32,
        /// Requested minor version
        minor: u32,
        /// Why the request was rejected
        reason: String,
    },

    /// The context is not in a state that allows the operation.
    #[error("Invalid context state: {0}")]
    InvalidState(&'static str),

    // ========================================================================
    // Kernel Errors
    // ========================================================================
    /// The kernel failed to parse. Carries the full diagnostic text.
    #[error("Shader compilation failed:\n{log}")]
    CompileFailed {
        /// Diagnostic log reported by the front end
        log: String,
    },

    /// The kernel failed validation or uses an unsupported interface.
    #[error("Program link failed:\n{log}")]
    LinkFailed {
        /// Diagnostic log reported by the validator
        log: String,
    },

    // ========================================================================
    // I/O Errors
    // ========================================================================
    /// A shader file could not be opened or read.
    #[error("Failed to read shader file {path}: {source}")]
    ShaderFile {
        /// Path that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A shader file returned fewer bytes than its reported length.
    #[error("Short read on shader file {path}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Path that was being read
        path: PathBuf,
        /// Length reported by the file metadata
        expected: u64,
        /// Bytes actually read
        actual: u64,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// The handle is null, was destroyed, or belongs to another context.
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),

    /// A size or dimension argument was rejected.
    #[error("Invalid resource parameters: {0}")]
    InvalidResource(String),

    /// A kernel binding has no resource bound to it, or the bound resource is
    /// incompatible with the kernel's declaration.
    #[error("Binding {binding} ({name}): {reason}")]
    BindingMismatch {
        /// Binding index in descriptor set 0
        binding: u32,
        /// Declared name in the kernel, if any
        name: String,
        /// What is wrong with the binding
        reason: String,
    },

    /// A uniform was set with a value of the wrong type.
    #[error("Uniform `{name}` is declared as {declared} but was set as {provided}")]
    UniformTypeMismatch {
        /// Uniform name as resolved
        name: String,
        /// Declared type in the kernel
        declared: &'static str,
        /// Type of the provided value
        provided: &'static str,
    },

    /// A write or read range exceeds the buffer allocation.
    #[error("Buffer access out of bounds: offset {offset} + size {size} exceeds allocation of {capacity} bytes")]
    OutOfBounds {
        /// Requested byte offset
        offset: u64,
        /// Requested byte count
        size: u64,
        /// Allocated size reported by the device
        capacity: u64,
    },

    // ========================================================================
    // Synchronization Errors
    // ========================================================================
    /// A fence wait timed out.
    #[error("Async operation timed out after {timeout:?}")]
    SyncTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A fence wait or buffer mapping failed.
    #[error("Synchronization failed: {0}")]
    SyncFailed(String),

    // ========================================================================
    // Profiling Errors
    // ========================================================================
    /// The timer was ended without being started, or started twice.
    #[error("Timer misuse: {0}")]
    TimerMisuse(&'static str),
}

impl ComputeError {
    /// Returns the coarse classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdapterRequestFailed(_)
            | Self::DeviceCreateFailed(_)
            | Self::UnsupportedVersion { .. } => ErrorKind::Init,
            Self::InvalidState(_) => ErrorKind::State,
            Self::CompileFailed { .. } => ErrorKind::Compile,
            Self::LinkFailed { .. } => ErrorKind::Link,
            Self::ShaderFile { .. } | Self::ShortRead { .. } => ErrorKind::Io,
            Self::InvalidHandle(_)
            | Self::InvalidResource(_)
            | Self::BindingMismatch { .. }
            | Self::UniformTypeMismatch { .. } => ErrorKind::Resource,
            Self::OutOfBounds { .. } => ErrorKind::Bounds,
            Self::SyncTimeout { .. } => ErrorKind::SyncTimeout,
            Self::SyncFailed(_) => ErrorKind::SyncFailure,
            Self::TimerMisuse(_) => ErrorKind::TimerMisuse,
        }
    }
}

// ============================================================================
// Convenient conversion implementations
// ============================================================================

impl From<wgpu::BufferAsyncError> for ComputeError {
    fn from(err: wgpu::BufferAsyncError) -> Self {
        ComputeError::SyncFailed(format!("buffer mapping failed: {err}"))
    }
}

impl From<wgpu::PollError> for ComputeError {
    fn from(err: wgpu::PollError) -> Self {
        ComputeError::SyncFailed(format!("device poll failed: {err}"))
    }
}

/// Alias for `Result<T, ComputeError>`.
pub type Result<T> = std::result::Result<T, ComputeError>;
