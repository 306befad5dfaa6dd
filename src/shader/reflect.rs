//! Kernel Front End and Interface Reflection
//!
//! GLSL compute source is parsed by the `naga` GLSL front end and validated
//! before any device object is created, so compile and link diagnostics are
//! produced with full source spans.
//!
//! Reflection produces a [`KernelLayout`]: the workgroup size and every
//! descriptor-set-0 resource that the entry point actually uses. Resources
//! that are declared but never touched are left out, matching the layout the
//! device derives for the pipeline.
//!
//! GLSL `barrier()` and the `memoryBarrier*()` family are lowered to
//! work-group, storage and image scopes. The front end also marks them as
//! subgroup barriers, which would demand a capability that plain GLSL
//! compute never needs.

use wgpu::naga;

use crate::errors::{ComputeError, Result};
use crate::resources::TextureFormat;

/// Scalar, vector or matrix type of a uniform block member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    Int,
    UInt,
    Float,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    /// Anything the setters cannot write (arrays, nested structs, doubles).
    Other,
}

impl UniformType {
    fn from_inner(inner: &naga::TypeInner) -> Self {
        use naga::{ScalarKind, VectorSize};

        match *inner {
            naga::TypeInner::Scalar(naga::Scalar { kind, width: 4 }) => match kind {
                ScalarKind::Sint => Self::Int,
                ScalarKind::Uint => Self::UInt,
                ScalarKind::Float => Self::Float,
                _ => Self::Other,
            },
            naga::TypeInner::Vector {
                size,
                scalar: naga::Scalar { kind: ScalarKind::Float, width: 4 },
            } => match size {
                VectorSize::Bi => Self::Vec2,
                VectorSize::Tri => Self::Vec3,
                VectorSize::Quad => Self::Vec4,
            },
            naga::TypeInner::Matrix {
                columns: VectorSize::Quad,
                rows: VectorSize::Quad,
                scalar: naga::Scalar { kind: ScalarKind::Float, width: 4 },
            } => Self::Mat4,
            _ => Self::Other,
        }
    }

    /// GLSL spelling, used in diagnostics.
    #[must_use]
    pub const fn glsl_name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::Vec2 => "vec2",
            Self::Vec3 => "vec3",
            Self::Vec4 => "vec4",
            Self::Mat4 => "mat4",
            Self::Other => "<unsupported>",
        }
    }

    /// Bytes written by a setter of this type.
    #[must_use]
    pub const fn size(self) -> u32 {
        match self {
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Vec2 => 8,
            Self::Vec3 => 12,
            Self::Vec4 => 16,
            Self::Mat4 => 64,
            Self::Other => 0,
        }
    }
}

/// One settable member of a uniform block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformField {
    pub name: String,
    /// Byte offset inside the block (std140).
    pub offset: u32,
    pub ty: UniformType,
}

/// A `uniform` block in descriptor set 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlockLayout {
    pub binding: u32,
    /// Instance name of the block, when the kernel gives one.
    pub name: Option<String>,
    /// Block size in bytes.
    pub size: u32,
    pub fields: Vec<UniformField>,
}

/// What a binding in descriptor set 0 expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    /// `buffer` block, filled from the buffer slot table.
    StorageBuffer {
        read_only: bool,
        /// Smallest buffer the kernel can legally address.
        min_size: u64,
    },
    /// `image2D` / `image3D`, filled from the image unit table.
    StorageImage {
        format: TextureFormat,
        dimension: wgpu::TextureViewDimension,
        access: wgpu::StorageTextureAccess,
    },
    /// `uniform` block, owned by the program (index into
    /// [`KernelLayout::uniform_blocks`]).
    UniformBlock { index: usize },
}

/// A used resource of the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSlot {
    pub binding: u32,
    pub name: String,
    pub kind: BindingKind,
}

/// Reflected interface of a compute kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    pub entry_point: String,
    pub workgroup_size: [u32; 3],
    /// Sorted by binding index.
    pub bindings: Vec<BindingSlot>,
    pub uniform_blocks: Vec<UniformBlockLayout>,
    /// Bytes of `shared` memory the entry point uses, each variable rounded
    /// up to 16 bytes.
    pub shared_memory: u32,
}

impl KernelLayout {
    /// Resolves a uniform by member name or `block.member`.
    ///
    /// Returns `(block index, field)`.
    #[must_use]
    pub fn find_uniform(&self, name: &str) -> Option<(usize, &UniformField)> {
        if let Some((block, member)) = name.split_once('.') {
            return self.uniform_blocks.iter().enumerate().find_map(|(i, b)| {
                (b.name.as_deref() == Some(block))
                    .then(|| b.fields.iter().find(|f| f.name == member))
                    .flatten()
                    .map(|f| (i, f))
            });
        }
        self.uniform_blocks
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.fields.iter().find(|f| f.name == name).map(|f| (i, f)))
    }
}

/// A parsed and validated kernel, ready for pipeline creation.
pub(crate) struct TranslatedKernel {
    pub module: naga::Module,
    pub layout: KernelLayout,
}

/// Parses, validates and reflects GLSL compute source.
pub(crate) fn translate(source: &str) -> Result<TranslatedKernel> {
    let options = naga::front::glsl::Options::from(naga::ShaderStage::Compute);
    let mut module = naga::front::glsl::Frontend::default()
        .parse(&options, source)
        .map_err(|errors| ComputeError::CompileFailed {
            log: errors.emit_to_string(source),
        })?;
    lower_barriers(&mut module);

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .map_err(|err| ComputeError::LinkFailed {
        log: err.emit_to_string(source),
    })?;

    let layout = reflect(&module, &info)?;
    Ok(TranslatedKernel { module, layout })
}

const GLSL_BARRIER_SCOPES: naga::Barrier = naga::Barrier::WORK_GROUP
    .union(naga::Barrier::STORAGE)
    .union(naga::Barrier::TEXTURE);

fn lower_barriers(module: &mut naga::Module) {
    for (_, function) in module.functions.iter_mut() {
        lower_block_barriers(&mut function.body);
    }
    for entry in &mut module.entry_points {
        lower_block_barriers(&mut entry.function.body);
    }
}

fn lower_block_barriers(block: &mut naga::Block) {
    for statement in block.iter_mut() {
        match statement {
            naga::Statement::ControlBarrier(scopes) | naga::Statement::MemoryBarrier(scopes) => {
                if scopes.intersects(GLSL_BARRIER_SCOPES) {
                    *scopes &= GLSL_BARRIER_SCOPES;
                }
            }
            naga::Statement::Block(inner) => lower_block_barriers(inner),
            naga::Statement::If { accept, reject, .. } => {
                lower_block_barriers(accept);
                lower_block_barriers(reject);
            }
            naga::Statement::Switch { cases, .. } => {
                for case in cases {
                    lower_block_barriers(&mut case.body);
                }
            }
            naga::Statement::Loop { body, continuing, .. } => {
                lower_block_barriers(body);
                lower_block_barriers(continuing);
            }
            _ => {}
        }
    }
}

fn reflect(module: &naga::Module, info: &naga::valid::ModuleInfo) -> Result<KernelLayout> {
    let (ep_index, entry) = module
        .entry_points
        .iter()
        .enumerate()
        .find(|(_, ep)| ep.stage == naga::ShaderStage::Compute)
        .ok_or_else(|| link_error("kernel has no compute entry point"))?;
    let usage = info.get_entry_point(ep_index);

    let mut bindings = Vec::new();
    let mut uniform_blocks = Vec::new();
    let mut shared_memory = 0u32;

    for (handle, var) in module.global_variables.iter() {
        if usage[handle].is_empty() {
            continue;
        }
        if var.space == naga::AddressSpace::WorkGroup {
            let size = module.types[var.ty].inner.size(module.to_ctx());
            shared_memory = shared_memory.saturating_add(size.next_multiple_of(16));
            continue;
        }
        let Some(res) = &var.binding else {
            continue;
        };
        let name = var
            .name
            .clone()
            .or_else(|| module.types[var.ty].name.clone())
            .unwrap_or_default();
        if res.group != 0 {
            return Err(link_error(format!(
                "`{name}` uses descriptor set {}; only set 0 is supported",
                res.group
            )));
        }

        let kind = match var.space {
            naga::AddressSpace::Storage { access } => BindingKind::StorageBuffer {
                read_only: !access.contains(naga::StorageAccess::STORE),
                min_size: min_binding_size(module, var.ty),
            },
            naga::AddressSpace::Uniform => {
                uniform_blocks.push(uniform_block(module, var, res.binding));
                BindingKind::UniformBlock { index: uniform_blocks.len() - 1 }
            }
            naga::AddressSpace::Handle => image_binding(module, var, &name)?,
            _ => continue,
        };

        if bindings.iter().any(|b: &BindingSlot| b.binding == res.binding) {
            return Err(link_error(format!(
                "binding {} is declared more than once",
                res.binding
            )));
        }
        bindings.push(BindingSlot { binding: res.binding, name, kind });
    }

    bindings.sort_by_key(|b| b.binding);

    Ok(KernelLayout {
        entry_point: entry.name.clone(),
        workgroup_size: entry.workgroup_size,
        bindings,
        uniform_blocks,
        shared_memory,
    })
}

fn image_binding(
    module: &naga::Module,
    var: &naga::GlobalVariable,
    name: &str,
) -> Result<BindingKind> {
    let &naga::TypeInner::Image {
        dim,
        arrayed,
        class: naga::ImageClass::Storage { format, access },
    } = &module.types[var.ty].inner
    else {
        return Err(link_error(format!(
            "`{name}` is a sampler or sampled texture; only storage images are supported"
        )));
    };

    let dimension = match (dim, arrayed) {
        (naga::ImageDimension::D2, false) => wgpu::TextureViewDimension::D2,
        (naga::ImageDimension::D3, false) => wgpu::TextureViewDimension::D3,
        _ => {
            return Err(link_error(format!(
                "`{name}` must be a non-arrayed image2D or image3D"
            )));
        }
    };
    let format = TextureFormat::from_storage_format(format)
        .ok_or_else(|| link_error(format!("`{name}` uses unsupported image format {format:?}")))?;

    let access = match (
        access.contains(naga::StorageAccess::LOAD),
        access.contains(naga::StorageAccess::STORE),
    ) {
        (true, true) => wgpu::StorageTextureAccess::ReadWrite,
        (true, false) => wgpu::StorageTextureAccess::ReadOnly,
        _ => wgpu::StorageTextureAccess::WriteOnly,
    };

    Ok(BindingKind::StorageImage { format, dimension, access })
}

fn uniform_block(
    module: &naga::Module,
    var: &naga::GlobalVariable,
    binding: u32,
) -> UniformBlockLayout {
    let ty = &module.types[var.ty];
    match &ty.inner {
        naga::TypeInner::Struct { members, span } => UniformBlockLayout {
            binding,
            name: var.name.clone(),
            size: *span,
            fields: members
                .iter()
                .filter_map(|m| {
                    Some(UniformField {
                        name: m.name.clone()?,
                        offset: m.offset,
                        ty: UniformType::from_inner(&module.types[m.ty].inner),
                    })
                })
                .collect(),
        },
        inner => UniformBlockLayout {
            binding,
            name: None,
            size: inner.size(module.to_ctx()),
            fields: vec![UniformField {
                name: var.name.clone().unwrap_or_default(),
                offset: 0,
                ty: UniformType::from_inner(inner),
            }],
        },
    }
}

/// Smallest buffer size that covers a storage block, counting one element of
/// a trailing runtime-sized array.
fn min_binding_size(module: &naga::Module, ty: naga::Handle<naga::Type>) -> u64 {
    match &module.types[ty].inner {
        naga::TypeInner::Struct { members, span } => match members.last() {
            Some(last) => match module.types[last.ty].inner {
                naga::TypeInner::Array {
                    size: naga::ArraySize::Dynamic,
                    stride,
                    ..
                } => u64::from(last.offset + stride),
                _ => u64::from(*span),
            },
            None => u64::from(*span),
        },
        naga::TypeInner::Array {
            size: naga::ArraySize::Dynamic,
            stride,
            ..
        } => u64::from(*stride),
        inner => u64::from(inner.size(module.to_ctx())),
    }
}

fn link_error(msg: impl Into<String>) -> ComputeError {
    ComputeError::LinkFailed { log: msg.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    const REDUCE: &str = r"#version 450
layout(local_size_x = 256) in;
layout(std430, binding = 0) readonly buffer Input { float values[]; };
layout(std430, binding = 1) buffer Output { float partial[]; };
layout(std140, binding = 2) uniform Params { uint count; float scale; vec4 tint; mat4 xform; } params;
void main() {
    uint i = gl_GlobalInvocationID.x;
    if (i < params.count) {
        partial[gl_WorkGroupID.x] = values[i] * params.scale + params.tint.x + params.xform[0][0];
    }
}
";

    #[test]
    fn reflects_buffers_and_uniform_block() {
        let kernel = translate(REDUCE).expect("kernel should translate");
        let layout = kernel.layout;

        assert_eq!(layout.workgroup_size, [256, 1, 1]);
        assert_eq!(layout.bindings.len(), 3);
        assert!(matches!(
            layout.bindings[0].kind,
            BindingKind::StorageBuffer { read_only: true, min_size: 4 }
        ));
        assert!(matches!(
            layout.bindings[1].kind,
            BindingKind::StorageBuffer { read_only: false, .. }
        ));
        assert!(matches!(layout.bindings[2].kind, BindingKind::UniformBlock { index: 0 }));

        let block = &layout.uniform_blocks[0];
        assert_eq!(block.binding, 2);
        assert_eq!(block.name.as_deref(), Some("params"));
        let tys: Vec<_> = block.fields.iter().map(|f| (f.name.as_str(), f.ty, f.offset)).collect();
        assert_eq!(
            tys,
            [
                ("count", UniformType::UInt, 0),
                ("scale", UniformType::Float, 4),
                ("tint", UniformType::Vec4, 16),
                ("xform", UniformType::Mat4, 32),
            ]
        );
    }

    #[test]
    fn uniform_lookup_accepts_member_and_qualified_names() {
        let layout = translate(REDUCE).unwrap().layout;
        assert_eq!(layout.find_uniform("scale").map(|(i, f)| (i, f.offset)), Some((0, 4)));
        assert_eq!(layout.find_uniform("params.tint").map(|(_, f)| f.ty), Some(UniformType::Vec4));
        assert!(layout.find_uniform("other.tint").is_none());
        assert!(layout.find_uniform("missing").is_none());
    }

    #[test]
    fn unused_resources_are_not_reflected() {
        let src = r"#version 450
layout(local_size_x = 1) in;
layout(std430, binding = 0) buffer Used { uint a[]; };
layout(std430, binding = 5) buffer Unused { uint b[]; };
void main() { a[0] = 1u; }
";
        let layout = translate(src).unwrap().layout;
        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].binding, 0);
    }

    #[test]
    fn storage_images_carry_format_and_dimension() {
        let src = r"#version 450
layout(local_size_x = 8, local_size_y = 8) in;
layout(rgba32f, binding = 0) uniform image2D img;
void main() {
    ivec2 p = ivec2(gl_GlobalInvocationID.xy);
    imageStore(img, p, imageLoad(img, p) * 2.0);
}
";
        let layout = translate(src).unwrap().layout;
        assert_eq!(layout.workgroup_size, [8, 8, 1]);
        assert_eq!(
            layout.bindings[0].kind,
            BindingKind::StorageImage {
                format: TextureFormat::Rgba32Float,
                dimension: wgpu::TextureViewDimension::D2,
                access: wgpu::StorageTextureAccess::ReadWrite,
            }
        );
    }

    #[test]
    fn fixed_size_block_reports_span() {
        let src = r"#version 450
layout(local_size_x = 1) in;
layout(std430, binding = 0) buffer Counters { uint hits; uint misses; vec2 pad; };
void main() { hits = misses; }
";
        let layout = translate(src).unwrap().layout;
        assert!(matches!(
            layout.bindings[0].kind,
            BindingKind::StorageBuffer { min_size: 16, .. }
        ));
    }

    #[test]
    fn syntax_error_is_compile_failure_with_log() {
        let err = translate("#version 450\nvoid main() { this is not glsl; }\n")
            .err()
            .expect("should fail");
        assert_eq!(err.kind(), ErrorKind::Compile);
        assert!(!err.to_string().is_empty());
    }

    fn barrier_scopes(block: &naga::Block, found: &mut Vec<naga::Barrier>) {
        for statement in block.iter() {
            match statement {
                naga::Statement::ControlBarrier(scopes) | naga::Statement::MemoryBarrier(scopes) => {
                    found.push(*scopes);
                }
                naga::Statement::Block(inner) => barrier_scopes(inner, found),
                naga::Statement::If { accept, reject, .. } => {
                    barrier_scopes(accept, found);
                    barrier_scopes(reject, found);
                }
                naga::Statement::Loop { body, continuing, .. } => {
                    barrier_scopes(body, found);
                    barrier_scopes(continuing, found);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn shared_memory_barriers_validate_without_subgroups() {
        let src = r"#version 450
layout(local_size_x = 64) in;
layout(std430, binding = 0) buffer Data { float values[]; };
shared float scratch[64];
void main() {
    uint lid = gl_LocalInvocationID.x;
    scratch[lid] = values[gl_GlobalInvocationID.x];
    barrier();
    for (uint stride = 32u; stride > 0u; stride = stride / 2u) {
        if (lid < stride) {
            scratch[lid] += scratch[lid + stride];
        }
        memoryBarrierShared();
        barrier();
    }
    if (lid == 0u) {
        values[gl_WorkGroupID.x] = scratch[0];
    }
}
";
        let kernel = translate(src).expect("barriers should validate");
        assert_eq!(kernel.layout.shared_memory, 256);

        let mut found = Vec::new();
        barrier_scopes(&kernel.module.entry_points[0].function.body, &mut found);
        assert!(!found.is_empty());
        assert!(found.iter().all(|s| !s.contains(naga::Barrier::SUB_GROUP)));
    }

    #[test]
    fn shared_memory_rounds_each_variable() {
        let src = r"#version 450
layout(local_size_x = 1) in;
layout(std430, binding = 0) buffer Data { float values[]; };
shared float a;
shared vec3 b[3];
void main() {
    a = values[0];
    b[2] = vec3(a);
    values[1] = b[2].y;
}
";
        // 4 -> 16, 3 * 16 = 48.
        assert_eq!(translate(src).unwrap().layout.shared_memory, 64);
    }

    #[test]
    fn non_zero_set_is_link_failure() {
        let src = r"#version 450
layout(local_size_x = 1) in;
layout(std430, set = 1, binding = 0) buffer Data { uint d[]; };
void main() { d[0] = 0u; }
";
        let err = translate(src).err().expect("should fail");
        assert_eq!(err.kind(), ErrorKind::Link);
    }
}
