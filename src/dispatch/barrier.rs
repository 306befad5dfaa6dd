//! Memory Barriers
//!
//! Recorded dispatches become visible to later host reads and device commands
//! once the pending command stream is submitted. A barrier is that
//! submission point.

use bitflags::bitflags;

use crate::context::{ComputeContext, GpuState};
use crate::errors::Result;

bitflags! {
    /// Kinds of writes a barrier makes visible.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BarrierFlags: u32 {
        const STORAGE_BUFFER = 1 << 0;
        const STORAGE_IMAGE  = 1 << 1;
        const BUFFER_UPDATE  = 1 << 2;
        const TEXTURE_UPDATE = 1 << 3;
        const UNIFORM        = 1 << 4;
        const ALL = Self::STORAGE_BUFFER.bits()
            | Self::STORAGE_IMAGE.bits()
            | Self::BUFFER_UPDATE.bits()
            | Self::TEXTURE_UPDATE.bits()
            | Self::UNIFORM.bits();
    }
}

impl GpuState {
    pub(crate) fn barrier(&mut self, mask: BarrierFlags) {
        if mask.is_empty() {
            return;
        }
        if self.flush().is_some() && self.debug {
            log::debug!("barrier {mask:?}: submitted pending dispatches");
        }
    }
}

impl ComputeContext {
    /// Makes the writes selected by `mask` visible. An empty mask does
    /// nothing.
    pub fn barrier(&mut self, mask: BarrierFlags) -> Result<()> {
        self.with_gpu(|gpu| {
            gpu.barrier(mask);
            Ok(())
        })
    }

    /// Makes every prior write visible.
    pub fn barrier_all(&mut self) -> Result<()> {
        self.barrier(BarrierFlags::ALL)
    }
}
