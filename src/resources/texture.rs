//! Storage Images
//!
//! 2D and 3D images with a fixed [`TextureFormat`]. The whole image (one mip
//! level) is exposed to kernels for simultaneous read and write through an
//! image unit.

use serde::{Deserialize, Serialize};
use slotmap::Key;

use super::{TextureFormat, TextureHandle, align_up};
use crate::context::{ComputeContext, GpuState};
use crate::errors::{ComputeError, Result};
use crate::readback::StagedRead;

/// Image dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureDimension {
    D2,
    D3,
}

impl TextureDimension {
    fn to_wgpu(self) -> wgpu::TextureDimension {
        match self {
            Self::D2 => wgpu::TextureDimension::D2,
            Self::D3 => wgpu::TextureDimension::D3,
        }
    }

    pub(crate) fn view_dimension(self) -> wgpu::TextureViewDimension {
        match self {
            Self::D2 => wgpu::TextureViewDimension::D2,
            Self::D3 => wgpu::TextureViewDimension::D3,
        }
    }
}

/// Shape and format of a storage image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    /// `1` for 2D images.
    pub depth: u32,
    pub format: TextureFormat,
    pub dimension: TextureDimension,
}

impl TextureInfo {
    /// Tightly packed size of the image in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.depth)
            * u64::from(self.format.texel_size())
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: self.depth,
        }
    }
}

pub(crate) struct GpuTexture {
    pub(crate) texture: wgpu::Texture,
    pub(crate) view: wgpu::TextureView,
    pub(crate) info: TextureInfo,
}

const IMAGE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::STORAGE_BINDING
    .union(wgpu::TextureUsages::TEXTURE_BINDING)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::COPY_DST);

impl GpuState {
    pub(crate) fn texture(&self, handle: TextureHandle) -> Result<&GpuTexture> {
        self.textures
            .get(handle)
            .ok_or(ComputeError::InvalidHandle("texture"))
    }

    /// Format capabilities as the device sees them.
    pub(crate) fn format_features(&self, format: TextureFormat) -> wgpu::TextureFormatFeatures {
        let features = self.device.features();
        if features.contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES) {
            self.adapter.get_texture_format_features(format.to_wgpu())
        } else {
            format.to_wgpu().guaranteed_format_features(features)
        }
    }

    pub(crate) fn create_texture(&mut self, info: TextureInfo, data: Option<&[u8]>) -> Result<TextureHandle> {
        let TextureInfo { width, height, depth, format, dimension } = info;
        if width == 0 || height == 0 || depth == 0 {
            return Err(ComputeError::InvalidResource(format!(
                "texture dimensions must be positive, got {width}x{height}x{depth}"
            )));
        }
        let max = match dimension {
            TextureDimension::D2 => self.limits.max_texture_dimension_2d,
            TextureDimension::D3 => self.limits.max_texture_dimension_3d,
        };
        if width > max || height > max || depth > max {
            return Err(ComputeError::InvalidResource(format!(
                "texture {width}x{height}x{depth} exceeds the {dimension:?} limit of {max}"
            )));
        }
        if !self
            .format_features(format)
            .allowed_usages
            .contains(wgpu::TextureUsages::STORAGE_BINDING)
        {
            return Err(ComputeError::InvalidResource(format!(
                "{format:?} cannot be used as a storage image on this device"
            )));
        }
        if let Some(data) = data
            && data.len() as u64 != info.byte_size()
        {
            return Err(ComputeError::InvalidResource(format!(
                "initial data is {} bytes, {width}x{height}x{depth} {format:?} needs {}",
                data.len(),
                info.byte_size()
            )));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&self.settings.label),
            size: info.extent(),
            mip_level_count: 1,
            sample_count: 1,
            dimension: dimension.to_wgpu(),
            format: format.to_wgpu(),
            usage: IMAGE_USAGE,
            view_formats: &[],
        });

        if let Some(data) = data {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(width * format.texel_size()),
                    rows_per_image: Some(height),
                },
                info.extent(),
            );
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        if self.debug {
            log::debug!(
                "created {dimension:?} {format:?} texture {width}x{height}x{depth} ({:?} layout)",
                format.channel_layout()
            );
        }
        Ok(self.textures.insert(GpuTexture { texture, view, info }))
    }

    /// Reads the whole image, tightly packed row by row.
    pub(crate) fn read_texture(&mut self, handle: TextureHandle) -> Result<Vec<u8>> {
        let (texture, info) = {
            let tex = self.texture(handle)?;
            (tex.texture.clone(), tex.info)
        };
        let row = info.width * info.format.texel_size();
        let padded_row = align_up(u64::from(row), u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)) as u32;
        let rows = info.height * info.depth;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("myth-compute texture readback"),
            size: u64::from(padded_row) * u64::from(rows),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.encoder().copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(info.height),
                },
            },
            info.extent(),
        );
        let submission = self.submit();
        let total = (padded_row * rows) as usize;
        let padded = StagedRead::new(staging, submission, 0, total).wait(&self.device, None)?;

        if padded_row == row {
            return Ok(padded);
        }
        let mut packed = Vec::with_capacity((row * rows) as usize);
        for chunk in padded.chunks_exact(padded_row as usize) {
            packed.extend_from_slice(&chunk[..row as usize]);
        }
        Ok(packed)
    }

    pub(crate) fn destroy_texture(&mut self, handle: TextureHandle) {
        if handle.is_null() {
            if self.debug {
                log::debug!("destroy_texture on null handle ignored");
            }
            return;
        }
        if self.textures.remove(handle).is_some() {
            self.bindings.changed();
            if self.debug {
                log::debug!("destroyed texture {handle:?}");
            }
        } else if self.debug {
            log::debug!("destroy_texture on stale handle {handle:?} ignored");
        }
    }
}

impl ComputeContext {
    /// Allocates a 2D storage image, optionally seeded with tightly packed
    /// texels in the format's channel layout.
    pub fn create_texture_2d(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        data: Option<&[u8]>,
    ) -> Result<TextureHandle> {
        let info = TextureInfo {
            width,
            height,
            depth: 1,
            format,
            dimension: TextureDimension::D2,
        };
        self.with_gpu(|gpu| gpu.create_texture(info, data))
    }

    /// Allocates a 3D storage image.
    pub fn create_texture_3d(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        format: TextureFormat,
        data: Option<&[u8]>,
    ) -> Result<TextureHandle> {
        let info = TextureInfo {
            width,
            height,
            depth,
            format,
            dimension: TextureDimension::D3,
        };
        self.with_gpu(|gpu| gpu.create_texture(info, data))
    }

    /// Exposes the whole image to the next dispatches at image unit `unit`.
    /// A null handle clears the unit.
    pub fn bind_texture(&mut self, handle: TextureHandle, unit: u32) -> Result<()> {
        self.with_gpu(|gpu| {
            if !handle.is_null() {
                gpu.texture(handle)?;
            }
            gpu.bindings.bind_image(unit, handle);
            if gpu.debug {
                log::debug!("bound texture {handle:?} to unit {unit}");
            }
            Ok(())
        })
    }

    /// Reads the whole image back, blocking until prior work completes.
    pub fn read_texture(&mut self, handle: TextureHandle) -> Result<Vec<u8>> {
        self.with_gpu(|gpu| gpu.read_texture(handle))
    }

    pub fn texture_info(&mut self, handle: TextureHandle) -> Result<TextureInfo> {
        self.with_gpu(|gpu| Ok(gpu.texture(handle)?.info))
    }

    /// Releases the image. Null and already destroyed handles are ignored.
    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        if let Ok(gpu) = self.gpu_mut() {
            gpu.destroy_texture(handle);
        }
    }
}
