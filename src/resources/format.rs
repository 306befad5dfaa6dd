//! Texel Formats
//!
//! The fixed table that maps every supported image format to its device
//! format, its host-side channel layout and component type, and its texel
//! size. Initial uploads and readbacks are interpreted through this table;
//! nothing is inferred from the data.

use serde::{Deserialize, Serialize};
use wgpu::naga;

/// Host-side channel layout of a texel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelLayout {
    /// One channel (`RED` / `RED_INTEGER`).
    Red,
    /// Two channels (`RG` / `RG_INTEGER`).
    Rg,
    /// Four channels (`RGBA` / `RGBA_INTEGER`).
    Rgba,
}

impl ChannelLayout {
    /// Number of channels.
    #[inline]
    #[must_use]
    pub const fn channels(self) -> u32 {
        match self {
            Self::Red => 1,
            Self::Rg => 2,
            Self::Rgba => 4,
        }
    }
}

/// Host-side element type of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentType {
    /// 32-bit float.
    Float,
    /// 32-bit signed integer.
    Int,
    /// 32-bit unsigned integer.
    UInt,
    /// 8-bit unsigned normalized.
    UNorm8,
}

impl ComponentType {
    /// Size of one channel in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> u32 {
        match self {
            Self::Float | Self::Int | Self::UInt => 4,
            Self::UNorm8 => 1,
        }
    }

    /// Integer formats use the `*_INTEGER` channel layouts.
    #[inline]
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::Int | Self::UInt)
    }
}

/// Image formats usable as read/write compute images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Sint,
    Rg32Sint,
    Rgba32Sint,
    R32Uint,
    Rg32Uint,
    Rgba32Uint,
    Rgba8Unorm,
}

impl TextureFormat {
    /// Every entry of the table.
    pub const ALL: [TextureFormat; 10] = [
        Self::R32Float,
        Self::Rg32Float,
        Self::Rgba32Float,
        Self::R32Sint,
        Self::Rg32Sint,
        Self::Rgba32Sint,
        Self::R32Uint,
        Self::Rg32Uint,
        Self::Rgba32Uint,
        Self::Rgba8Unorm,
    ];

    /// Device format.
    #[must_use]
    pub const fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            Self::R32Float => wgpu::TextureFormat::R32Float,
            Self::Rg32Float => wgpu::TextureFormat::Rg32Float,
            Self::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            Self::R32Sint => wgpu::TextureFormat::R32Sint,
            Self::Rg32Sint => wgpu::TextureFormat::Rg32Sint,
            Self::Rgba32Sint => wgpu::TextureFormat::Rgba32Sint,
            Self::R32Uint => wgpu::TextureFormat::R32Uint,
            Self::Rg32Uint => wgpu::TextureFormat::Rg32Uint,
            Self::Rgba32Uint => wgpu::TextureFormat::Rgba32Uint,
            Self::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        }
    }

    /// Channel layout used for uploads and readbacks.
    #[must_use]
    pub const fn channel_layout(self) -> ChannelLayout {
        match self {
            Self::R32Float | Self::R32Sint | Self::R32Uint => ChannelLayout::Red,
            Self::Rg32Float | Self::Rg32Sint | Self::Rg32Uint => ChannelLayout::Rg,
            Self::Rgba32Float | Self::Rgba32Sint | Self::Rgba32Uint | Self::Rgba8Unorm => {
                ChannelLayout::Rgba
            }
        }
    }

    /// Element type of each channel.
    #[must_use]
    pub const fn component_type(self) -> ComponentType {
        match self {
            Self::R32Float | Self::Rg32Float | Self::Rgba32Float => ComponentType::Float,
            Self::R32Sint | Self::Rg32Sint | Self::Rgba32Sint => ComponentType::Int,
            Self::R32Uint | Self::Rg32Uint | Self::Rgba32Uint => ComponentType::UInt,
            Self::Rgba8Unorm => ComponentType::UNorm8,
        }
    }

    /// Bytes per texel.
    #[inline]
    #[must_use]
    pub const fn texel_size(self) -> u32 {
        self.channel_layout().channels() * self.component_type().size()
    }

    /// Format declared by a kernel's `layout(<format>) image*` qualifier.
    #[must_use]
    pub fn from_storage_format(format: naga::StorageFormat) -> Option<Self> {
        Some(match format {
            naga::StorageFormat::R32Float => Self::R32Float,
            naga::StorageFormat::Rg32Float => Self::Rg32Float,
            naga::StorageFormat::Rgba32Float => Self::Rgba32Float,
            naga::StorageFormat::R32Sint => Self::R32Sint,
            naga::StorageFormat::Rg32Sint => Self::Rg32Sint,
            naga::StorageFormat::Rgba32Sint => Self::Rgba32Sint,
            naga::StorageFormat::R32Uint => Self::R32Uint,
            naga::StorageFormat::Rg32Uint => Self::Rg32Uint,
            naga::StorageFormat::Rgba32Uint => Self::Rgba32Uint,
            naga::StorageFormat::Rgba8Unorm => Self::Rgba8Unorm,
            _ => return None,
        })
    }
}
