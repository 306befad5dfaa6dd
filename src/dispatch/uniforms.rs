//! Uniform Setters
//!
//! Values are written into the host copy of the active program's uniform
//! block and uploaded before its next dispatch. Names are resolved against
//! the reflected block members, either bare (`scale`) or qualified with the
//! block instance name (`params.scale`).
//!
//! A name that does not resolve is ignored; kernels legitimately differ in
//! the parameters they declare. With debug logging on, the miss is traced.

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::context::{ComputeContext, GpuState};
use crate::errors::{ComputeError, Result};
use crate::shader::UniformType;

mod sealed {
    pub trait Sealed {}
}

/// A value that can be written to a uniform block member.
pub trait UniformValue: sealed::Sealed + Copy {
    /// Declared type this value matches.
    const TYPE: UniformType;

    /// std140 bytes of the value.
    fn bytes(&self) -> &[u8];
}

macro_rules! impl_uniform_value {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl UniformValue for $ty {
                const TYPE: UniformType = UniformType::$kind;

                fn bytes(&self) -> &[u8] {
                    bytemuck::bytes_of(self)
                }
            }
        )*
    };
}

impl_uniform_value! {
    i32 => Int,
    u32 => UInt,
    f32 => Float,
    Vec2 => Vec2,
    Vec3 => Vec3,
    Vec4 => Vec4,
    Mat4 => Mat4,
}

impl GpuState {
    pub(crate) fn set_uniform<V: UniformValue>(&mut self, name: &str, value: V) -> Result<()> {
        let handle = self.bind_active_program()?;
        let debug = self.debug;
        let program = self
            .programs
            .get_mut(handle)
            .ok_or(ComputeError::InvalidHandle("program"))?;

        let Some((block, field)) = program.layout.find_uniform(name) else {
            if debug {
                log::debug!("uniform `{name}` not found in `{}`, ignored", program.label);
            }
            return Ok(());
        };
        if field.ty != V::TYPE {
            return Err(ComputeError::UniformTypeMismatch {
                name: name.to_string(),
                declared: field.ty.glsl_name(),
                provided: V::TYPE.glsl_name(),
            });
        }

        let offset = field.offset as usize;
        let bytes = value.bytes();
        let storage = &mut program.uniforms[block];
        let dst = storage
            .data
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| ComputeError::InvalidResource(format!("uniform `{name}` lies outside its block")))?;
        dst.copy_from_slice(bytes);
        storage.dirty = true;
        Ok(())
    }

    /// Uploads modified uniform blocks of `program`.
    pub(crate) fn upload_uniforms(&mut self, handle: crate::resources::ProgramHandle) -> Result<()> {
        if !self.program(handle)?.uniforms.iter().any(|u| u.dirty) {
            return Ok(());
        }
        // Work already recorded must run with the values it was recorded with.
        self.flush();

        let program = self
            .programs
            .get_mut(handle)
            .ok_or(ComputeError::InvalidHandle("program"))?;
        for storage in program.uniforms.iter_mut().filter(|u| u.dirty) {
            self.queue.write_buffer(&storage.buffer, 0, &storage.data);
            storage.dirty = false;
        }
        Ok(())
    }
}

impl ComputeContext {
    /// Sets a uniform of the active program.
    ///
    /// Fails when no program is active or the declared type differs.
    pub fn set_uniform<V: UniformValue>(&mut self, name: &str, value: V) -> Result<()> {
        self.with_gpu(|gpu| gpu.set_uniform(name, value))
    }

    /// Sets an `int` uniform of the active program.
    pub fn set_uniform_int(&mut self, name: &str, value: i32) -> Result<()> {
        self.set_uniform(name, value)
    }

    /// Sets an `uint` uniform of the active program.
    pub fn set_uniform_uint(&mut self, name: &str, value: u32) -> Result<()> {
        self.set_uniform(name, value)
    }

    /// Sets an `float` uniform of the active program.
    pub fn set_uniform_float(&mut self, name: &str, value: f32) -> Result<()> {
        self.set_uniform(name, value)
    }

    /// Sets an `vec2` uniform of the active program.
    pub fn set_uniform_vec2(&mut self, name: &str, value: Vec2) -> Result<()> {
        self.set_uniform(name, value)
    }

    /// Sets an `vec3` uniform of the active program.
    pub fn set_uniform_vec3(&mut self, name: &str, value: Vec3) -> Result<()> {
        self.set_uniform(name, value)
    }

    /// Sets an `vec4` uniform of the active program.
    pub fn set_uniform_vec4(&mut self, name: &str, value: Vec4) -> Result<()> {
        self.set_uniform(name, value)
    }

    /// Column-major 4x4 matrix.
    pub fn set_uniform_mat4(&mut self, name: &str, value: Mat4) -> Result<()> {
        self.set_uniform(name, value)
    }
}
