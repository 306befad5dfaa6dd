//! Dispatch Engine
//!
//! Binds the active program, resolves its resources from the binding tables
//! and records compute passes into the pending command stream.
//!
//! # Cached binding
//!
//! Uniform setters and dispatches compare the active program with the last
//! bound one and only rebind when it differs. The bind group is rebuilt only
//! when the bound program changes or the binding tables move to a new
//! version. Replacing the active program through hot reload drops the cache.
//! [`DispatchStats`](crate::DispatchStats) exposes the counters.

pub mod barrier;
pub mod uniforms;

pub use barrier::BarrierFlags;
pub use uniforms::UniformValue;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::context::{ComputeContext, GpuState, new_stream};
use crate::errors::{ComputeError, Result};
use crate::resources::ProgramHandle;
use crate::shader::{BindingKind, BindingSlot};

/// Last bound program and the bind group built for it.
#[derive(Default)]
pub(crate) struct BindCache {
    pub(crate) program: Option<ProgramHandle>,
    bindings_version: u64,
    group: Option<wgpu::BindGroup>,
}

impl BindCache {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    fn bind(&mut self, program: ProgramHandle) {
        self.program = Some(program);
        self.group = None;
    }
}

fn mismatch(slot: &BindingSlot, reason: impl Into<String>) -> ComputeError {
    ComputeError::BindingMismatch {
        binding: slot.binding,
        name: slot.name.clone(),
        reason: reason.into(),
    }
}

impl GpuState {
    /// Binds the active program unless it is already bound.
    pub(crate) fn bind_active_program(&mut self) -> Result<ProgramHandle> {
        let handle = self
            .active_program
            .ok_or(ComputeError::InvalidState("no active program"))?;
        self.program(handle)?;

        if self.bind_cache.program != Some(handle) {
            self.bind_cache.bind(handle);
            self.stats.program_binds += 1;
            if self.debug {
                log::debug!("bound program {handle:?}");
            }
        }
        Ok(handle)
    }

    fn ensure_bind_group(&mut self, handle: ProgramHandle) -> Result<()> {
        let version = self.bindings.version();
        if self.bind_cache.group.is_some() && self.bind_cache.bindings_version == version {
            return Ok(());
        }

        let group = {
            let program = self.program(handle)?;
            let Some(layout) = &program.bind_group_layout else {
                return Ok(());
            };

            let mut buffer_access = FxHashMap::default();
            let mut image_access = FxHashMap::default();
            let mut entries: SmallVec<[wgpu::BindGroupEntry; 8]> = SmallVec::new();

            for slot in &program.layout.bindings {
                let resource = match &slot.kind {
                    BindingKind::StorageBuffer { read_only, min_size } => {
                        let bound = self
                            .bindings
                            .buffer(slot.binding)
                            .ok_or_else(|| mismatch(slot, "no buffer bound"))?;
                        let buffer = self
                            .buffers
                            .get(bound)
                            .ok_or_else(|| mismatch(slot, "bound buffer was destroyed"))?;
                        if buffer.buffer.size() < *min_size {
                            return Err(mismatch(
                                slot,
                                format!(
                                    "buffer is {} bytes, kernel needs at least {min_size}",
                                    buffer.buffer.size()
                                ),
                            ));
                        }
                        let max_binding = u64::from(self.limits.max_storage_buffer_binding_size);
                        if buffer.buffer.size() > max_binding {
                            return Err(mismatch(
                                slot,
                                format!(
                                    "buffer is {} bytes, the device binds at most {max_binding}",
                                    buffer.buffer.size()
                                ),
                            ));
                        }
                        if let Some(prev) = buffer_access.insert(bound, *read_only)
                            && prev != *read_only
                        {
                            return Err(mismatch(
                                slot,
                                "buffer is also bound read-only/read-write at another slot",
                            ));
                        }
                        buffer.buffer.as_entire_binding()
                    }
                    BindingKind::StorageImage { format, dimension, access } => {
                        let bound = self
                            .bindings
                            .image(slot.binding)
                            .ok_or_else(|| mismatch(slot, "no image bound"))?;
                        let texture = self
                            .textures
                            .get(bound)
                            .ok_or_else(|| mismatch(slot, "bound image was destroyed"))?;
                        if texture.info.format != *format {
                            return Err(mismatch(
                                slot,
                                format!(
                                    "image is {:?}, kernel declares {format:?}",
                                    texture.info.format
                                ),
                            ));
                        }
                        if texture.info.dimension.view_dimension() != *dimension {
                            return Err(mismatch(
                                slot,
                                format!(
                                    "image is {:?}, kernel declares {dimension:?}",
                                    texture.info.dimension
                                ),
                            ));
                        }
                        if let Some(prev) = image_access.insert(bound, *access)
                            && prev != *access
                        {
                            return Err(mismatch(
                                slot,
                                "image is bound with a different access at another unit",
                            ));
                        }
                        wgpu::BindingResource::TextureView(&texture.view)
                    }
                    BindingKind::UniformBlock { index } => program
                        .uniforms
                        .get(*index)
                        .ok_or_else(|| mismatch(slot, "uniform block storage missing"))?
                        .buffer
                        .as_entire_binding(),
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: slot.binding,
                    resource,
                });
            }

            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&program.label),
                layout,
                entries: &entries,
            })
        };

        self.bind_cache.group = Some(group);
        self.bind_cache.bindings_version = version;
        self.stats.bind_group_builds += 1;
        if self.debug {
            log::debug!("built bind group for {handle:?} (bindings v{version})");
        }
        Ok(())
    }

    /// Records one dispatch of the active program without submitting it.
    pub(crate) fn record_dispatch(&mut self, groups: [u32; 3]) -> Result<()> {
        let max = self.limits.max_compute_workgroups_per_dimension;
        if groups.iter().any(|&n| n > max) {
            return Err(ComputeError::InvalidResource(format!(
                "grid {groups:?} exceeds {max} work groups per dimension"
            )));
        }

        let handle = self.bind_active_program()?;
        self.ensure_bind_group(handle)?;
        self.upload_uniforms(handle)?;

        let program = self
            .programs
            .get(handle)
            .ok_or(ComputeError::InvalidHandle("program"))?;
        let encoder = self.encoder.get_or_insert_with(|| new_stream(&self.device));
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&program.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            if program.bind_group_layout.is_some()
                && let Some(group) = &self.bind_cache.group
            {
                pass.set_bind_group(0, group, &[]);
            }
            let [x, y, z] = groups;
            pass.dispatch_workgroups(x, y, z);
        }

        self.stats.dispatches += 1;
        if self.debug {
            log::debug!("dispatch {groups:?} of `{}`", program.label);
        }
        Ok(())
    }
}

impl ComputeContext {
    /// Dispatches the active program over an `nx * ny * nz` grid of work
    /// groups, followed by a full barrier.
    ///
    /// Fails without dispatching when no program is active, a binding is
    /// missing or incompatible, or the grid exceeds the device limits.
    pub fn dispatch(&mut self, nx: u32, ny: u32, nz: u32) -> Result<()> {
        self.with_gpu(|gpu| {
            gpu.record_dispatch([nx, ny, nz])?;
            gpu.barrier(BarrierFlags::ALL);
            Ok(())
        })
    }

    /// [`dispatch`](Self::dispatch) over `nx` work groups in x.
    pub fn dispatch_1d(&mut self, nx: u32) -> Result<()> {
        self.dispatch(nx, 1, 1)
    }

    /// [`dispatch`](Self::dispatch) over an `nx` by `ny` grid of work groups.
    pub fn dispatch_2d(&mut self, nx: u32, ny: u32) -> Result<()> {
        self.dispatch(nx, ny, 1)
    }

    /// Records a dispatch without the automatic barrier. The work is
    /// submitted by the next [`barrier`](Self::barrier) or host transfer.
    pub fn enqueue_dispatch(&mut self, nx: u32, ny: u32, nz: u32) -> Result<()> {
        self.with_gpu(|gpu| gpu.record_dispatch([nx, ny, nz]))
    }
}
