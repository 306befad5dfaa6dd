//! Binding Tables
//!
//! Buffer slots and image units are plain associations: binding a resource
//! records `index -> handle` and takes no ownership. Any resource may be bound
//! to any index at any time.
//!
//! Every change bumps a version counter. The dispatch path compares this
//! version with the one its cached bind group was built against.

use rustc_hash::FxHashMap;
use slotmap::Key;

use super::{BufferHandle, TextureHandle};

/// Per-context `binding -> resource` associations for descriptor set 0.
#[derive(Debug, Default)]
pub struct BindingTable {
    buffers: FxHashMap<u32, BufferHandle>,
    images: FxHashMap<u32, TextureHandle>,
    version: u64,
}

impl BindingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `handle` with buffer slot `slot`. A null handle clears it.
    pub fn bind_buffer(&mut self, slot: u32, handle: BufferHandle) {
        if handle.is_null() {
            self.buffers.remove(&slot);
        } else {
            self.buffers.insert(slot, handle);
        }
        self.changed();
    }

    /// Associates `handle` with image unit `unit`. A null handle clears it.
    pub fn bind_image(&mut self, unit: u32, handle: TextureHandle) {
        if handle.is_null() {
            self.images.remove(&unit);
        } else {
            self.images.insert(unit, handle);
        }
        self.changed();
    }

    #[must_use]
    pub fn buffer(&self, slot: u32) -> Option<BufferHandle> {
        self.buffers.get(&slot).copied()
    }

    #[must_use]
    pub fn image(&self, unit: u32) -> Option<TextureHandle> {
        self.images.get(&unit).copied()
    }

    /// Marks the table as modified without changing an association.
    ///
    /// Called when a bound resource is destroyed.
    pub fn changed(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}
