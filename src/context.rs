//! Compute Context
//!
//! [`ComputeContext`] is the session object. It owns the device connection,
//! every resource arena, the binding tables, the pending command stream, the
//! async readback slot, the timer and the last-error slot. Nothing is shared
//! between contexts, so several contexts can coexist in one process; a single
//! context is driven from one thread at a time (`&mut self` everywhere).
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --init--> Ready --destroy--> Destroyed
//! ```
//!
//! Only `init` is accepted while uninitialized, and a failed `init` leaves the
//! context uninitialized. Every operation other than `destroy` fails with
//! [`ErrorKind::State`](crate::ErrorKind::State) once destroyed, and
//! `destroy` itself is a no-op outside `Ready`.
//!
//! # Errors
//!
//! Every public operation returns a [`Result`]. Failures are additionally
//! logged and recorded in the last-error slot, which successful calls never
//! clear.

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::dispatch::BindCache;
use crate::errors::{ComputeError, Result};
use crate::profiler::GpuTimer;
use crate::readback::PendingReadback;
use crate::resources::buffer::GpuBuffer;
use crate::resources::texture::GpuTexture;
use crate::resources::{BindingTable, BufferHandle, ProgramHandle, TextureHandle};
use crate::settings::ComputeSettings;
use crate::shader::program::Program;

/// Compute capability version provided by every context.
pub const PROVIDED_VERSION: (u32, u32) = (4, 6);

/// Oldest version that has a compute stage.
pub const MIN_VERSION: (u32, u32) = (4, 3);

/// Dispatch limits of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeLimits {
    /// Maximum work groups per grid dimension.
    pub max_group_count: [u32; 3],
    /// Maximum local size per dimension.
    pub max_group_size: [u32; 3],
    /// Maximum invocations in one work group.
    pub max_invocations: u32,
    /// Maximum bytes of `shared` memory per work group.
    pub max_shared_memory: u32,
    /// Maximum storage buffers one kernel may use.
    pub max_storage_buffers: u32,
    /// Maximum storage images one kernel may use.
    pub max_storage_images: u32,
    /// Largest buffer that can be bound to a storage slot.
    pub max_storage_binding_size: u64,
    /// Largest buffer that can be allocated.
    pub max_buffer_size: u64,
}

impl ComputeLimits {
    fn from_wgpu(limits: &wgpu::Limits) -> Self {
        let groups = limits.max_compute_workgroups_per_dimension;
        Self {
            max_group_count: [groups; 3],
            max_group_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_invocations: limits.max_compute_invocations_per_workgroup,
            max_shared_memory: limits.max_compute_workgroup_storage_size,
            max_storage_buffers: limits.max_storage_buffers_per_shader_stage,
            max_storage_images: limits.max_storage_textures_per_shader_stage,
            max_storage_binding_size: u64::from(limits.max_storage_buffer_binding_size),
            max_buffer_size: limits.max_buffer_size,
        }
    }
}

/// Counters for the cached-bind path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Times the bound program actually changed.
    pub program_binds: u64,
    /// Bind groups built (program or binding change).
    pub bind_group_builds: u64,
    /// Dispatches recorded.
    pub dispatches: u64,
    /// Command buffers submitted to the queue.
    pub submissions: u64,
}

/// Returns whether a context providing [`PROVIDED_VERSION`] satisfies a
/// request for `major.minor`.
#[must_use]
pub fn check_version_supported(major: u32, minor: u32) -> bool {
    PROVIDED_VERSION >= (major, minor)
}

fn negotiate_version(major: u32, minor: u32) -> Result<()> {
    let requested = (major, minor);
    let reason = if requested < MIN_VERSION {
        format!(
            "compute shaders require at least {}.{}",
            MIN_VERSION.0, MIN_VERSION.1
        )
    } else if !check_version_supported(major, minor) {
        format!(
            "newest available version is {}.{}",
            PROVIDED_VERSION.0, PROVIDED_VERSION.1
        )
    } else {
        return Ok(());
    };
    Err(ComputeError::UnsupportedVersion { major, minor, reason })
}

/// Starts a new pending command stream.
pub(crate) fn new_stream(device: &wgpu::Device) -> wgpu::CommandEncoder {
    device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("myth-compute stream"),
    })
}

enum ContextState {
    Uninitialized,
    Ready(Box<GpuState>),
    Destroyed,
}

/// Everything that exists only while the context is `Ready`.
pub(crate) struct GpuState {
    pub(crate) adapter: wgpu::Adapter,
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    pub(crate) limits: wgpu::Limits,
    pub(crate) settings: ComputeSettings,
    pub(crate) debug: bool,

    pub(crate) buffers: SlotMap<BufferHandle, GpuBuffer>,
    pub(crate) textures: SlotMap<TextureHandle, GpuTexture>,
    pub(crate) programs: SlotMap<ProgramHandle, Program>,
    pub(crate) active_program: Option<ProgramHandle>,

    pub(crate) bindings: BindingTable,
    pub(crate) bind_cache: BindCache,
    pub(crate) stats: DispatchStats,

    /// Recorded but not yet submitted work.
    pub(crate) encoder: Option<wgpu::CommandEncoder>,
    pub(crate) pending_readback: Option<PendingReadback>,
    pub(crate) timer: GpuTimer,
}

impl GpuState {
    fn new(settings: &ComputeSettings, debug: bool, major: u32, minor: u32) -> Result<Self> {
        negotiate_version(major, minor)?;

        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: settings.power_preference,
            compatible_surface: None,
            force_fallback_adapter: settings.force_fallback_adapter,
        }))
        .map_err(|e| ComputeError::AdapterRequestFailed(e.to_string()))?;

        let info = adapter.get_info();
        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(ComputeError::UnsupportedVersion {
                major,
                minor,
                reason: format!("adapter `{}` has no compute stage", info.name),
            });
        }

        let required_features = settings.negotiated_features(adapter.features());
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some(&settings.label),
            required_features,
            required_limits: settings.negotiated_limits(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))?;

        if debug {
            log::debug!(
                "compute context ready: {} ({:?}), features {:?}",
                info.name,
                info.backend,
                required_features
            );
        }

        let limits = device.limits();
        let timer = GpuTimer::new(&device);
        Ok(Self {
            adapter,
            device,
            queue,
            limits,
            settings: settings.clone(),
            debug,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            programs: SlotMap::with_key(),
            active_program: None,
            bindings: BindingTable::new(),
            bind_cache: BindCache::default(),
            stats: DispatchStats::default(),
            encoder: None,
            pending_readback: None,
            timer,
        })
    }

    /// Pending command encoder, created on first use.
    pub(crate) fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        self.encoder.get_or_insert_with(|| new_stream(&self.device))
    }

    /// Submits recorded work. Returns the submission index when anything was
    /// pending.
    pub(crate) fn flush(&mut self) -> Option<wgpu::SubmissionIndex> {
        let encoder = self.encoder.take()?;
        self.stats.submissions += 1;
        Some(self.queue.submit(Some(encoder.finish())))
    }

    /// Submits recorded work and always returns an index covering it.
    pub(crate) fn submit(&mut self) -> wgpu::SubmissionIndex {
        match self.flush() {
            Some(index) => index,
            None => {
                self.stats.submissions += 1;
                self.queue.submit(std::iter::empty())
            }
        }
    }

    /// Blocks until every submitted command has completed.
    pub(crate) fn wait_idle(&mut self) -> Result<()> {
        let index = self.submit();
        self.device.poll(wgpu::PollType::Wait {
            submission_index: Some(index),
            timeout: None,
        })?;
        Ok(())
    }
}

/// A GPU compute session.
///
/// # Example
///
/// ```rust,ignore
/// use myth_compute::prelude::*;
///
/// let mut ctx = ComputeContext::new();
/// ctx.init(4, 3)?;
///
/// let program = ctx.compile(KERNEL)?;
/// let data = ctx.create_buffer_from_slice(&[1.0f32; 1024], BufferUsage::Static)?;
/// ctx.bind_buffer(data, 0)?;
/// ctx.set_active_program(program)?;
/// ctx.dispatch_1d(4)?;
///
/// let out: Vec<f32> = ctx.read_buffer_as(data, 1024)?;
/// ctx.destroy();
/// ```
pub struct ComputeContext {
    settings: ComputeSettings,
    state: ContextState,
    debug: bool,
    last_error: Option<String>,
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeContext {
    /// An uninitialized context with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(ComputeSettings::default())
    }

    /// An uninitialized context.
    #[must_use]
    pub fn with_settings(settings: ComputeSettings) -> Self {
        Self {
            debug: settings.debug_logging,
            settings,
            state: ContextState::Uninitialized,
            last_error: None,
        }
    }

    /// Connects to a device providing compute version `major.minor`.
    ///
    /// On failure the context stays uninitialized and may be initialized
    /// again.
    pub fn init(&mut self, major: u32, minor: u32) -> Result<()> {
        let result = match self.state {
            ContextState::Uninitialized => {
                GpuState::new(&self.settings, self.debug, major, minor).map(Box::new)
            }
            ContextState::Ready(_) => Err(ComputeError::InvalidState("context is already initialized")),
            ContextState::Destroyed => Err(ComputeError::InvalidState("context has been destroyed")),
        };
        let gpu = self.track(result)?;
        self.state = ContextState::Ready(gpu);
        Ok(())
    }

    /// Releases the active program, every resource and the device.
    ///
    /// Outstanding async reads and timer queries are dropped unread. Calling
    /// this on an uninitialized or already destroyed context does nothing.
    pub fn destroy(&mut self) {
        if !self.is_ready() {
            if self.debug {
                log::debug!("destroy on a context that is not ready ignored");
            }
            return;
        }
        if let ContextState::Ready(mut gpu) = std::mem::replace(&mut self.state, ContextState::Destroyed) {
            gpu.flush();
            if self.debug {
                log::debug!(
                    "destroying context: {} buffers, {} textures, {} programs",
                    gpu.buffers.len(),
                    gpu.textures.len(),
                    gpu.programs.len()
                );
            }
        }
    }

    /// Whether `init` has succeeded and `destroy` has not been called.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ContextState::Ready(_))
    }

    /// Message of the most recent failure. Not cleared by success.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Turns verbose `debug!` tracing on or off.
    pub fn set_debug_logging(&mut self, enabled: bool) {
        self.debug = enabled;
        if let ContextState::Ready(gpu) = &mut self.state {
            gpu.debug = enabled;
        }
    }

    /// Whether per-operation debug logging is on.
    #[must_use]
    pub fn debug_logging(&self) -> bool {
        self.debug
    }

    /// Settings the context was created with.
    #[must_use]
    pub fn settings(&self) -> &ComputeSettings {
        &self.settings
    }

    /// Whether a context can satisfy a request for `major.minor`.
    #[must_use]
    pub fn check_version_supported(&self, major: u32, minor: u32) -> bool {
        check_version_supported(major, minor)
    }

    /// Dispatch limits of the device.
    pub fn limits(&mut self) -> Result<ComputeLimits> {
        let result = self.gpu().map(|gpu| ComputeLimits::from_wgpu(&gpu.limits));
        self.track(result)
    }

    /// Name, vendor and backend of the adapter in use.
    pub fn adapter_info(&mut self) -> Result<wgpu::AdapterInfo> {
        let result = self.gpu().map(|gpu| gpu.adapter.get_info());
        self.track(result)
    }

    /// Counters of the cached-bind path since `init`.
    pub fn dispatch_stats(&mut self) -> Result<DispatchStats> {
        let result = self.gpu().map(|gpu| gpu.stats);
        self.track(result)
    }

    pub(crate) fn gpu(&self) -> Result<&GpuState> {
        match &self.state {
            ContextState::Ready(gpu) => Ok(gpu),
            ContextState::Uninitialized => Err(ComputeError::InvalidState("context is not initialized")),
            ContextState::Destroyed => Err(ComputeError::InvalidState("context has been destroyed")),
        }
    }

    pub(crate) fn gpu_mut(&mut self) -> Result<&mut GpuState> {
        match &mut self.state {
            ContextState::Ready(gpu) => Ok(gpu),
            ContextState::Uninitialized => Err(ComputeError::InvalidState("context is not initialized")),
            ContextState::Destroyed => Err(ComputeError::InvalidState("context has been destroyed")),
        }
    }

    /// Runs `op` against the ready device state, recording any failure.
    pub(crate) fn with_gpu<T>(&mut self, op: impl FnOnce(&mut GpuState) -> Result<T>) -> Result<T> {
        let result = self.gpu_mut().and_then(op);
        self.track(result)
    }

    /// Records a failure in the last-error slot.
    pub(crate) fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            log::error!("{err}");
            self.last_error = Some(err.to_string());
        }
        result
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        self.destroy();
    }
}
