//! Compute Programs
//!
//! Compilation turns GLSL source into a [`Program`]: a compute pipeline with
//! an automatically derived layout, its reflected [`KernelLayout`], and one
//! host-staged buffer per uniform block.
//!
//! The intermediate shader module exists only for the duration of pipeline
//! creation and is released on every path.

use std::borrow::Cow;
use std::path::Path;

use slotmap::Key;

use super::preprocess::inject_defines;
use super::reflect::{BindingKind, KernelLayout, UniformBlockLayout, translate};
use crate::context::{ComputeContext, GpuState};
use crate::errors::{ComputeError, Result};
use crate::resources::{ProgramHandle, align_up};

/// Host copy of a uniform block and the device buffer it is uploaded to.
pub(crate) struct UniformStorage {
    pub(crate) data: Vec<u8>,
    pub(crate) buffer: wgpu::Buffer,
    pub(crate) dirty: bool,
}

impl UniformStorage {
    fn new(device: &wgpu::Device, block: &UniformBlockLayout) -> Self {
        let size = align_up(u64::from(block.size.max(16)), 16);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: block.name.as_deref(),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            data: vec![0; size as usize],
            buffer,
            dirty: false,
        }
    }
}

/// A linked compute kernel.
pub(crate) struct Program {
    pub(crate) pipeline: wgpu::ComputePipeline,
    /// `None` when the kernel uses no resources.
    pub(crate) bind_group_layout: Option<wgpu::BindGroupLayout>,
    pub(crate) layout: KernelLayout,
    pub(crate) uniforms: Vec<UniformStorage>,
    pub(crate) label: String,
}

impl GpuState {
    pub(crate) fn program(&self, handle: ProgramHandle) -> Result<&Program> {
        self.programs
            .get(handle)
            .ok_or(ComputeError::InvalidHandle("program"))
    }

    pub(crate) fn compile(&mut self, source: &str, label: &str) -> Result<ProgramHandle> {
        let kernel = translate(source)?;
        check_kernel_limits(&kernel.layout, &self.limits)?;
        self.check_image_access(&kernel.layout)?;

        let pipeline = {
            let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Naga(Cow::Owned(kernel.module)),
            });
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: None,
                    module: &module,
                    entry_point: Some(&kernel.layout.entry_point),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
        };

        let layout = kernel.layout;
        let bind_group_layout =
            (!layout.bindings.is_empty()).then(|| pipeline.get_bind_group_layout(0));
        let uniforms = layout
            .uniform_blocks
            .iter()
            .map(|block| UniformStorage::new(&self.device, block))
            .collect();

        if self.debug {
            log::debug!(
                "compiled `{label}`: workgroup {:?}, {} bindings, {} uniform blocks",
                layout.workgroup_size,
                layout.bindings.len(),
                layout.uniform_blocks.len()
            );
        }

        Ok(self.programs.insert(Program {
            pipeline,
            bind_group_layout,
            layout,
            uniforms,
            label: label.to_string(),
        }))
    }

    /// Rejects images whose format cannot be accessed the way the kernel
    /// declares on this device.
    fn check_image_access(&self, layout: &KernelLayout) -> Result<()> {
        for slot in &layout.bindings {
            let BindingKind::StorageImage { format, access, .. } = slot.kind else {
                continue;
            };
            if !image_access_supported(&self.format_features(format), access) {
                return Err(ComputeError::LinkFailed {
                    log: format!(
                        "image `{}` (binding {}): {format:?} does not support {access:?} access on this device",
                        slot.name, slot.binding
                    ),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn set_active_program(&mut self, handle: ProgramHandle) -> Result<()> {
        if handle.is_null() {
            self.active_program = None;
            return Ok(());
        }
        self.program(handle)?;
        self.active_program = Some(handle);
        Ok(())
    }

    pub(crate) fn release_program(&mut self, handle: ProgramHandle) {
        if handle.is_null() {
            return;
        }
        if self.programs.remove(handle).is_none() {
            if self.debug {
                log::debug!("release_program on stale handle {handle:?} ignored");
            }
            return;
        }
        if self.active_program == Some(handle) {
            self.active_program = None;
        }
        if self.bind_cache.program == Some(handle) {
            self.bind_cache.reset();
        }
        if self.debug {
            log::debug!("released program {handle:?}");
        }
    }

    /// Compiles `path` and swaps it in as the active program. The previous
    /// active program is released only after the replacement is built.
    pub(crate) fn reload(&mut self, path: &Path) -> Result<ProgramHandle> {
        let source = read_source(path)?;
        let replacement = self.compile(&source, &path.display().to_string())?;

        if let Some(previous) = self.active_program.take() {
            self.release_program(previous);
        }
        self.active_program = Some(replacement);
        self.bind_cache.reset();

        if self.debug {
            log::debug!("hot-reloaded {}", path.display());
        }
        Ok(replacement)
    }
}

fn image_access_supported(
    features: &wgpu::TextureFormatFeatures,
    access: wgpu::StorageTextureAccess,
) -> bool {
    use wgpu::TextureFormatFeatureFlags as Flags;

    let required = match access {
        wgpu::StorageTextureAccess::ReadOnly => Flags::STORAGE_READ_ONLY,
        wgpu::StorageTextureAccess::WriteOnly => Flags::STORAGE_WRITE_ONLY,
        _ => Flags::STORAGE_READ_WRITE,
    };
    features.allowed_usages.contains(wgpu::TextureUsages::STORAGE_BINDING)
        && features.flags.contains(required)
}

/// Rejects kernels the device cannot build a pipeline for.
fn check_kernel_limits(layout: &KernelLayout, limits: &wgpu::Limits) -> Result<()> {
    let exceeded = |what: String| Err(ComputeError::LinkFailed { log: what });

    let [x, y, z] = layout.workgroup_size;
    let max_size = [
        limits.max_compute_workgroup_size_x,
        limits.max_compute_workgroup_size_y,
        limits.max_compute_workgroup_size_z,
    ];
    for (axis, (size, max)) in ["x", "y", "z"]
        .into_iter()
        .zip(layout.workgroup_size.into_iter().zip(max_size))
    {
        if size > max {
            return exceeded(format!("local_size_{axis} = {size} exceeds the device limit of {max}"));
        }
    }
    let invocations = u64::from(x) * u64::from(y) * u64::from(z);
    if invocations > u64::from(limits.max_compute_invocations_per_workgroup) {
        return exceeded(format!(
            "work group of {invocations} invocations exceeds the device limit of {}",
            limits.max_compute_invocations_per_workgroup
        ));
    }
    if layout.shared_memory > limits.max_compute_workgroup_storage_size {
        return exceeded(format!(
            "{} bytes of shared memory exceed the device limit of {}",
            layout.shared_memory, limits.max_compute_workgroup_storage_size
        ));
    }

    let count = |pred: fn(&BindingKind) -> bool| {
        layout.bindings.iter().filter(|b| pred(&b.kind)).count() as u32
    };
    let per_stage = [
        (
            "storage buffers",
            count(|k| matches!(k, BindingKind::StorageBuffer { .. })),
            limits.max_storage_buffers_per_shader_stage,
        ),
        (
            "storage images",
            count(|k| matches!(k, BindingKind::StorageImage { .. })),
            limits.max_storage_textures_per_shader_stage,
        ),
        (
            "uniform blocks",
            count(|k| matches!(k, BindingKind::UniformBlock { .. })),
            limits.max_uniform_buffers_per_shader_stage,
        ),
    ];
    for (what, used, max) in per_stage {
        if used > max {
            return exceeded(format!("kernel uses {used} {what}, the device allows {max}"));
        }
    }

    let max_uniform = u64::from(limits.max_uniform_buffer_binding_size);
    if let Some(block) = layout
        .uniform_blocks
        .iter()
        .find(|b| u64::from(b.size) > max_uniform)
    {
        return exceeded(format!(
            "uniform block at binding {} is {} bytes, the device allows {max_uniform}",
            block.binding, block.size
        ));
    }
    Ok(())
}

/// Reads a whole shader file, checking the byte count against the file's own
/// length.
fn read_source(path: &Path) -> Result<String> {
    let io_error = |source| ComputeError::ShaderFile {
        path: path.to_path_buf(),
        source,
    };
    let expected = std::fs::metadata(path).map_err(io_error)?.len();
    let bytes = std::fs::read(path).map_err(io_error)?;
    if (bytes.len() as u64) < expected {
        return Err(ComputeError::ShortRead {
            path: path.to_path_buf(),
            expected,
            actual: bytes.len() as u64,
        });
    }
    String::from_utf8(bytes).map_err(|e| {
        io_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

impl ComputeContext {
    /// Compiles and links a compute kernel.
    ///
    /// Parse failures are [`ErrorKind::Compile`](crate::ErrorKind::Compile),
    /// validation and interface failures are
    /// [`ErrorKind::Link`](crate::ErrorKind::Link); both carry the full
    /// diagnostic text.
    pub fn compile(&mut self, source: &str) -> Result<ProgramHandle> {
        self.with_gpu(|gpu| gpu.compile(source, "kernel"))
    }

    /// Compiles the kernel stored at `path`.
    pub fn compile_file(&mut self, path: impl AsRef<Path>) -> Result<ProgramHandle> {
        let path = path.as_ref();
        self.with_gpu(|gpu| {
            let source = read_source(path)?;
            gpu.compile(&source, &path.display().to_string())
        })
    }

    /// Compiles `source` with `#define` lines injected after its `#version`
    /// line. See [`inject_defines`].
    pub fn compile_with_defines<S: AsRef<str>>(&mut self, source: &str, defines: &[S]) -> Result<ProgramHandle> {
        let expanded = inject_defines(source, defines);
        self.with_gpu(|gpu| gpu.compile(&expanded, "kernel"))
    }

    /// Transactional hot reload.
    ///
    /// On success the previous active program is released and the new one
    /// becomes active. On failure the previous program stays active and
    /// bound.
    pub fn reload(&mut self, path: impl AsRef<Path>) -> Result<ProgramHandle> {
        let path = path.as_ref();
        self.with_gpu(|gpu| gpu.reload(path))
    }

    /// Makes `handle` the program used by uniform setters and dispatches.
    /// A null handle clears it.
    pub fn set_active_program(&mut self, handle: ProgramHandle) -> Result<()> {
        self.with_gpu(|gpu| gpu.set_active_program(handle))
    }

    /// The active program, if any.
    #[must_use]
    pub fn active_program(&self) -> Option<ProgramHandle> {
        self.gpu().ok().and_then(|gpu| gpu.active_program)
    }

    /// Releases a program. If it is active, no program is active afterwards.
    pub fn release_program(&mut self, handle: ProgramHandle) {
        if let Ok(gpu) = self.gpu_mut() {
            gpu.release_program(handle);
        }
    }

    /// Reflected interface of a program.
    pub fn kernel_layout(&mut self, handle: ProgramHandle) -> Result<KernelLayout> {
        self.with_gpu(|gpu| Ok(gpu.program(handle)?.layout.clone()))
    }
}
