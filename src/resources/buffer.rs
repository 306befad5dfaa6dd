//! Device Buffers
//!
//! Fixed-size storage buffers with an immutable usage hint.
//!
//! Allocations are rounded up to the 4-byte copy granularity and
//! [`ComputeContext::buffer_size`] always reports what the device allocated.
//! Every host write is bounds checked against that size before anything is
//! queued; a rejected write leaves the buffer untouched.
//!
//! Host transfers submit any recorded work first, so a read always observes
//! the dispatches issued before it and a write never overtakes them.

use std::ops::{Deref, DerefMut};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use slotmap::Key;
use wgpu::util::DeviceExt;

use super::{BufferHandle, COPY_ALIGNMENT, align_down, align_up};
use crate::context::{ComputeContext, GpuState};
use crate::errors::{ComputeError, Result};

/// Expected access pattern of a buffer. A placement hint, never a
/// correctness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BufferUsage {
    /// Uploaded once, read by the device many times.
    Static,
    /// Frequent host/device copies.
    #[default]
    Dynamic,
    /// Written by the host, consumed once by the device.
    Streaming,
}

/// Host access requested by [`ComputeContext::map_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapAccess {
    /// Contents are read back; nothing is written on unmap.
    ReadOnly,
    /// Contents start zeroed; the whole buffer is written on unmap.
    WriteOnly,
    /// Contents are read back and written on unmap.
    ReadWrite,
}

impl MapAccess {
    const fn reads(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    const fn writes(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

pub(crate) struct GpuBuffer {
    pub(crate) buffer: wgpu::Buffer,
    pub(crate) usage: BufferUsage,
}

pub(crate) const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// Host-side view of a buffer's contents.
///
/// Dereferences to the bytes. Changes are committed to the device on
/// [`unmap`](Self::unmap) or when the mapping is dropped, and land before
/// any work submitted afterwards.
pub struct BufferMapping {
    queue: wgpu::Queue,
    buffer: wgpu::Buffer,
    access: MapAccess,
    data: Vec<u8>,
    committed: bool,
}

impl BufferMapping {
    /// Access mode the buffer was mapped with.
    #[must_use]
    pub fn access(&self) -> MapAccess {
        self.access
    }

    /// Ends the mapping, committing writes.
    pub fn unmap(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        if self.access.writes() {
            self.queue.write_buffer(&self.buffer, 0, &self.data);
        }
    }
}

impl Deref for BufferMapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for BufferMapping {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for BufferMapping {
    fn drop(&mut self) {
        self.commit();
    }
}

impl std::fmt::Debug for BufferMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferMapping")
            .field("access", &self.access)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

fn check_range(offset: u64, size: u64, capacity: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(ComputeError::OutOfBounds { offset, size, capacity }),
    }
}

impl GpuState {
    pub(crate) fn buffer(&self, handle: BufferHandle) -> Result<&GpuBuffer> {
        self.buffers
            .get(handle)
            .ok_or(ComputeError::InvalidHandle("buffer"))
    }

    pub(crate) fn create_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
        usage: BufferUsage,
    ) -> Result<BufferHandle> {
        if size == 0 {
            return Err(ComputeError::InvalidResource(
                "buffer size must be positive".to_string(),
            ));
        }
        let data = data.unwrap_or_default();
        check_range(0, data.len() as u64, size)?;

        if size > self.limits.max_buffer_size {
            return Err(ComputeError::InvalidResource(format!(
                "buffer of {size} bytes exceeds the device limit of {} bytes",
                self.limits.max_buffer_size
            )));
        }
        let allocated = align_up(size, COPY_ALIGNMENT);

        let buffer = if usage == BufferUsage::Static && !data.is_empty() {
            let mut contents = data.to_vec();
            contents.resize(allocated as usize, 0);
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&self.settings.label),
                contents: &contents,
                usage: STORAGE_USAGE,
            })
        } else {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&self.settings.label),
                size: allocated,
                usage: STORAGE_USAGE,
                mapped_at_creation: false,
            });
            if !data.is_empty() {
                write_padded(&self.queue, &buffer, 0, data);
            }
            buffer
        };

        if self.debug {
            log::debug!("created {usage:?} buffer of {allocated} bytes ({} seeded)", data.len());
        }
        Ok(self.buffers.insert(GpuBuffer { buffer, usage }))
    }

    /// Bounds-checked partial update.
    pub(crate) fn write_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(handle)?.buffer.clone();
        let size = data.len() as u64;
        check_range(offset, size, buffer.size())?;
        if data.is_empty() {
            return Ok(());
        }

        self.flush();
        if offset % COPY_ALIGNMENT == 0 && size % COPY_ALIGNMENT == 0 {
            self.queue.write_buffer(&buffer, offset, data);
        } else {
            // Patch the enclosing aligned span.
            let start = align_down(offset, COPY_ALIGNMENT);
            let end = align_up(offset + size, COPY_ALIGNMENT);
            let mut span = self.stage_read(&buffer, start, end - start).wait(&self.device, None)?;
            let at = (offset - start) as usize;
            span[at..at + data.len()].copy_from_slice(data);
            self.queue.write_buffer(&buffer, start, &span);
        }

        if self.debug {
            log::debug!("wrote {size} bytes at offset {offset}");
        }
        Ok(())
    }

    pub(crate) fn read_buffer(&mut self, handle: BufferHandle, size: u64) -> Result<Vec<u8>> {
        let buffer = self.buffer(handle)?.buffer.clone();
        check_range(0, size, buffer.size())?;
        if size == 0 {
            return Ok(Vec::new());
        }
        self.stage_read(&buffer, 0, size).wait(&self.device, None)
    }

    pub(crate) fn map_buffer(&mut self, handle: BufferHandle, access: MapAccess) -> Result<BufferMapping> {
        let buffer = self.buffer(handle)?.buffer.clone();
        let size = buffer.size();
        let data = if access.reads() {
            self.stage_read(&buffer, 0, size).wait(&self.device, None)?
        } else {
            self.flush();
            vec![0; size as usize]
        };
        Ok(BufferMapping {
            queue: self.queue.clone(),
            buffer,
            access,
            data,
            committed: false,
        })
    }

    pub(crate) fn destroy_buffer(&mut self, handle: BufferHandle) {
        if handle.is_null() {
            if self.debug {
                log::debug!("destroy_buffer on null handle ignored");
            }
            return;
        }
        match self.buffers.remove(handle) {
            Some(_) => {
                self.bindings.changed();
                if self.debug {
                    log::debug!("destroyed buffer {handle:?}");
                }
            }
            None => {
                if self.debug {
                    log::debug!("destroy_buffer on stale handle {handle:?} ignored");
                }
            }
        }
    }
}

/// Queues a write whose length may not be a multiple of the copy alignment.
/// The tail of the span is zero-filled.
fn write_padded(queue: &wgpu::Queue, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) {
    if data.len() as u64 % COPY_ALIGNMENT == 0 {
        queue.write_buffer(buffer, offset, data);
    } else {
        let mut padded = data.to_vec();
        padded.resize(align_up(data.len() as u64, COPY_ALIGNMENT) as usize, 0);
        queue.write_buffer(buffer, offset, &padded);
    }
}

impl ComputeContext {
    /// Allocates a buffer of `size` bytes, optionally seeded with `data`.
    ///
    /// Shorter `data` is zero-padded. Rejects a zero size and `data` longer
    /// than `size`.
    pub fn create_buffer(&mut self, size: u64, data: Option<&[u8]>, usage: BufferUsage) -> Result<BufferHandle> {
        self.with_gpu(|gpu| gpu.create_buffer(size, data, usage))
    }

    /// Allocates a zero-filled buffer.
    pub fn create_zero_buffer(&mut self, size: u64) -> Result<BufferHandle> {
        self.create_buffer(size, None, BufferUsage::Dynamic)
    }

    /// Allocates a buffer holding exactly `data`.
    pub fn create_buffer_from_slice<T: Pod>(&mut self, data: &[T], usage: BufferUsage) -> Result<BufferHandle> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.create_buffer(bytes.len() as u64, Some(bytes), usage)
    }

    /// Writes `data` at `offset`.
    ///
    /// Fails with [`ErrorKind::Bounds`](crate::ErrorKind::Bounds), leaving the
    /// buffer unchanged, when the range exceeds the allocation.
    pub fn write_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.with_gpu(|gpu| gpu.write_buffer(handle, offset, data))
    }

    /// Reads the first `size` bytes, blocking until prior work completes.
    pub fn read_buffer(&mut self, handle: BufferHandle, size: u64) -> Result<Vec<u8>> {
        self.with_gpu(|gpu| gpu.read_buffer(handle, size))
    }

    /// Reads the first `count` elements of type `T`.
    pub fn read_buffer_as<T: Pod>(&mut self, handle: BufferHandle, count: usize) -> Result<Vec<T>> {
        // An unrepresentable size is reported as out of bounds.
        let size = count
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(u64::MAX);
        let bytes = self.read_buffer(handle, size)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Allocated size in bytes, as reported by the device.
    pub fn buffer_size(&mut self, handle: BufferHandle) -> Result<u64> {
        self.with_gpu(|gpu| Ok(gpu.buffer(handle)?.buffer.size()))
    }

    /// Usage hint chosen at creation.
    pub fn buffer_usage(&mut self, handle: BufferHandle) -> Result<BufferUsage> {
        self.with_gpu(|gpu| Ok(gpu.buffer(handle)?.usage))
    }

    /// Maps the whole buffer for host access.
    pub fn map_buffer(&mut self, handle: BufferHandle, access: MapAccess) -> Result<BufferMapping> {
        self.with_gpu(|gpu| gpu.map_buffer(handle, access))
    }

    /// Associates the buffer with binding `slot` of the next dispatches.
    ///
    /// A null handle clears the slot.
    pub fn bind_buffer(&mut self, handle: BufferHandle, slot: u32) -> Result<()> {
        self.with_gpu(|gpu| {
            if !handle.is_null() {
                gpu.buffer(handle)?;
            }
            gpu.bindings.bind_buffer(slot, handle);
            if gpu.debug {
                log::debug!("bound buffer {handle:?} to slot {slot}");
            }
            Ok(())
        })
    }

    /// Releases the buffer. Null and already destroyed handles are ignored.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        if let Ok(gpu) = self.gpu_mut() {
            gpu.destroy_buffer(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn range_check_rejects_overflow_and_overrun() {
        assert!(check_range(0, 16, 16).is_ok());
        assert!(check_range(8, 8, 16).is_ok());

        let err = check_range(12, 8, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bounds);
        assert!(check_range(u64::MAX, 2, 16).is_err());
    }

    #[test]
    fn map_access_directions() {
        assert!(MapAccess::ReadOnly.reads() && !MapAccess::ReadOnly.writes());
        assert!(!MapAccess::WriteOnly.reads() && MapAccess::WriteOnly.writes());
        assert!(MapAccess::ReadWrite.reads() && MapAccess::ReadWrite.writes());
    }

    #[test]
    fn dynamic_is_default_usage() {
        assert_eq!(BufferUsage::default(), BufferUsage::Dynamic);
    }
}
