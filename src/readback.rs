//! Device-to-Host Readback
//!
//! Every readback goes through a [`StagedRead`]: a copy into a `MAP_READ`
//! staging buffer is appended to the pending command stream, the stream is
//! submitted, and a map request is registered immediately. The submission
//! index plus the map callback channel form the fence.
//!
//! Synchronous reads wait on that fence at once. [`ComputeContext::read_async`]
//! parks it in the context's single readback slot instead, to be collected by
//! [`ComputeContext::wait_async`]. Issuing another async read replaces the
//! parked one; its result can no longer be collected.

use std::time::Duration;

use crate::context::{ComputeContext, GpuState};
use crate::errors::{ComputeError, Result};
use crate::resources::{BufferHandle, COPY_ALIGNMENT, align_down, align_up};

type MapResult = std::result::Result<(), wgpu::BufferAsyncError>;

/// A copy that has been submitted and whose staging buffer is being mapped.
pub(crate) struct StagedRead {
    staging: wgpu::Buffer,
    submission: wgpu::SubmissionIndex,
    /// Leading bytes of the staging buffer that precede the requested range.
    skip: usize,
    size: usize,
    mapped: flume::Receiver<MapResult>,
}

/// Unmaps on every exit path once a mapping has succeeded.
struct Unmap<'a>(&'a wgpu::Buffer);

impl Drop for Unmap<'_> {
    fn drop(&mut self) {
        self.0.unmap();
    }
}

impl StagedRead {
    /// Registers the map request for `staging`, whose copy was submitted as
    /// `submission`.
    pub(crate) fn new(
        staging: wgpu::Buffer,
        submission: wgpu::SubmissionIndex,
        skip: usize,
        size: usize,
    ) -> Self {
        let (sender, mapped) = flume::bounded(1);
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        Self {
            staging,
            submission,
            skip,
            size,
            mapped,
        }
    }

    /// Blocks until the copy is visible to the host, then returns exactly the
    /// requested bytes. The staging buffer is released on every path.
    pub(crate) fn wait(self, device: &wgpu::Device, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let polled = device.poll(wgpu::PollType::Wait {
            submission_index: Some(self.submission.clone()),
            timeout,
        });
        match polled {
            Ok(_) => {}
            Err(wgpu::PollError::Timeout) => {
                return Err(ComputeError::SyncTimeout {
                    timeout: timeout.unwrap_or_default(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        match self.mapped.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(ComputeError::SyncFailed(
                    "staging buffer mapping did not complete".to_string(),
                ));
            }
        }

        let _unmap = Unmap(&self.staging);
        let view = self.staging.slice(..).get_mapped_range();
        Ok(view[self.skip..self.skip + self.size].to_vec())
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

/// The context's single outstanding async read.
pub(crate) struct PendingReadback {
    pub(crate) read: StagedRead,
    pub(crate) source: BufferHandle,
    pub(crate) offset: u64,
}

impl GpuState {
    /// Appends a copy of `source[offset..offset + size]` to the pending
    /// stream, submits it and starts mapping the result.
    ///
    /// The range must already be bounds checked.
    pub(crate) fn stage_read(&mut self, source: &wgpu::Buffer, offset: u64, size: u64) -> StagedRead {
        let start = align_down(offset, COPY_ALIGNMENT);
        let end = align_up(offset + size, COPY_ALIGNMENT);
        let span = end - start;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("myth-compute readback"),
            size: span,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.encoder()
            .copy_buffer_to_buffer(source, start, &staging, 0, span);
        let submission = self.submit();

        StagedRead::new(
            staging,
            submission,
            (offset - start) as usize,
            size as usize,
        )
    }

    pub(crate) fn read_async(&mut self, handle: BufferHandle, size: u64, offset: u64) -> Result<()> {
        let buffer = self.buffer(handle)?.buffer.clone();
        if size == 0 {
            return Err(ComputeError::InvalidResource(
                "async read size must be positive".to_string(),
            ));
        }
        let capacity = buffer.size();
        if offset.checked_add(size).is_none_or(|end| end > capacity) {
            return Err(ComputeError::OutOfBounds { offset, size, capacity });
        }

        let read = self.stage_read(&buffer, offset, size);
        let replaced = self.pending_readback.replace(PendingReadback {
            read,
            source: handle,
            offset,
        });
        if self.debug {
            if let Some(old) = replaced {
                log::debug!(
                    "async read of {:?} at {} replaced before it was waited on",
                    old.source,
                    old.offset
                );
            }
            log::debug!("async read issued: {size} bytes at offset {offset}");
        }
        Ok(())
    }

    pub(crate) fn wait_async(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let Some(pending) = self.pending_readback.take() else {
            if self.debug {
                log::debug!("wait_async with no outstanding read");
            }
            return Ok(None);
        };
        if self.debug {
            log::debug!("waiting up to {timeout:?} for {} bytes", pending.read.size());
        }
        pending.read.wait(&self.device, Some(timeout)).map(Some)
    }
}

impl ComputeContext {
    /// Starts a non-blocking read of `size` bytes at `offset`.
    ///
    /// Replaces any read that has not been waited on yet.
    pub fn read_async(&mut self, handle: BufferHandle, size: u64, offset: u64) -> Result<()> {
        self.with_gpu(|gpu| gpu.read_async(handle, size, offset))
    }

    /// Waits for the outstanding async read using the configured timeout.
    ///
    /// Returns `Ok(None)` when no read is outstanding. The fence is released
    /// whether the wait succeeds, times out or fails.
    pub fn wait_async(&mut self) -> Result<Option<Vec<u8>>> {
        let timeout = self.settings().async_timeout;
        self.wait_async_timeout(timeout)
    }

    /// [`wait_async`](Self::wait_async) with an explicit timeout.
    pub fn wait_async_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.with_gpu(|gpu| gpu.wait_async(timeout))
    }

    /// Whether an async read is waiting to be collected.
    #[must_use]
    pub fn has_pending_read(&self) -> bool {
        self.gpu()
            .is_ok_and(|gpu| gpu.pending_readback.is_some())
    }
}
