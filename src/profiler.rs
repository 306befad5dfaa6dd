//! Dispatch Timer
//!
//! Measures the device time spent between [`ComputeContext::timer_begin`] and
//! [`ComputeContext::timer_end`].
//!
//! When the device supports timestamps inside command encoders, two
//! timestamps bracket the recorded work and `timer_end` blocks until they are
//! resolved. Otherwise the timer falls back to the host clock, draining the
//! queue at both ends so only the bracketed work is measured.
//!
//! There is one timer per context and it does not nest: beginning a running
//! timer or ending a stopped one is a [`TimerMisuse`](crate::ErrorKind::TimerMisuse)
//! error.

use std::time::Instant;

use crate::context::{ComputeContext, GpuState, new_stream};
use crate::errors::{ComputeError, Result};
use crate::readback::StagedRead;

const TIMESTAMP_FEATURES: wgpu::Features =
    wgpu::Features::TIMESTAMP_QUERY.union(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS);

const RESOLVE_SIZE: u64 = 2 * std::mem::size_of::<u64>() as u64;

struct TimestampQueries {
    set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
}

impl TimestampQueries {
    fn new(device: &wgpu::Device) -> Self {
        let set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("myth-compute timer"),
            ty: wgpu::QueryType::Timestamp,
            count: 2,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("myth-compute timer resolve"),
            size: RESOLVE_SIZE,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self { set, resolve }
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerStart {
    Device,
    Host(Instant),
}

/// Query objects are created on first use and dropped by
/// [`ComputeContext::destroy_timer`].
pub(crate) struct GpuTimer {
    device_timed: bool,
    queries: Option<TimestampQueries>,
    running: Option<TimerStart>,
}

impl GpuTimer {
    pub(crate) fn new(device: &wgpu::Device) -> Self {
        Self {
            device_timed: device.features().contains(TIMESTAMP_FEATURES),
            queries: None,
            running: None,
        }
    }
}

/// Converts a pair of raw timestamps to milliseconds.
fn ticks_to_ms(begin: u64, end: u64, period_ns: f32) -> f64 {
    end.saturating_sub(begin) as f64 * f64::from(period_ns) / 1_000_000.0
}

impl GpuState {
    pub(crate) fn timer_begin(&mut self) -> Result<()> {
        if self.timer.running.is_some() {
            return Err(ComputeError::TimerMisuse(
                "timer_begin called while the timer is already running",
            ));
        }

        if self.timer.device_timed {
            let queries = self
                .timer
                .queries
                .get_or_insert_with(|| TimestampQueries::new(&self.device));
            self.encoder
                .get_or_insert_with(|| new_stream(&self.device))
                .write_timestamp(&queries.set, 0);
            self.timer.running = Some(TimerStart::Device);
        } else {
            self.wait_idle()?;
            self.timer.running = Some(TimerStart::Host(Instant::now()));
        }

        if self.debug {
            log::debug!("timer started ({})", if self.timer.device_timed { "device" } else { "host" });
        }
        Ok(())
    }

    pub(crate) fn timer_end(&mut self) -> Result<f64> {
        let start = self
            .timer
            .running
            .take()
            .ok_or(ComputeError::TimerMisuse("timer_end called without timer_begin"))?;

        let elapsed = match start {
            TimerStart::Host(begin) => {
                self.wait_idle()?;
                begin.elapsed().as_secs_f64() * 1000.0
            }
            TimerStart::Device => {
                let queries = self
                    .timer
                    .queries
                    .as_ref()
                    .ok_or(ComputeError::TimerMisuse("timer query objects were released"))?;
                let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("myth-compute timer readback"),
                    size: RESOLVE_SIZE,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let encoder = self.encoder.get_or_insert_with(|| new_stream(&self.device));
                encoder.write_timestamp(&queries.set, 1);
                encoder.resolve_query_set(&queries.set, 0..2, &queries.resolve, 0);
                encoder.copy_buffer_to_buffer(&queries.resolve, 0, &staging, 0, RESOLVE_SIZE);

                let submission = self.submit();
                let bytes = StagedRead::new(staging, submission, 0, RESOLVE_SIZE as usize)
                    .wait(&self.device, None)?;
                let [begin, end]: [u64; 2] = bytemuck::pod_read_unaligned(&bytes);
                ticks_to_ms(begin, end, self.queue.get_timestamp_period())
            }
        };

        if self.debug {
            log::debug!("timer stopped: {elapsed:.3} ms");
        }
        Ok(elapsed)
    }
}

impl ComputeContext {
    /// Starts timing the work recorded from now on.
    pub fn timer_begin(&mut self) -> Result<()> {
        self.with_gpu(GpuState::timer_begin)
    }

    /// Stops the timer and returns the elapsed time in milliseconds.
    ///
    /// Blocks until the measurement is available.
    pub fn timer_end(&mut self) -> Result<f64> {
        self.with_gpu(GpuState::timer_end)
    }

    /// Releases the timer's query objects and stops a running measurement.
    pub fn destroy_timer(&mut self) {
        if let Ok(gpu) = self.gpu_mut() {
            gpu.timer.queries = None;
            gpu.timer.running = None;
        }
    }

    /// Whether a measurement is in progress.
    #[must_use]
    pub fn is_timer_running(&self) -> bool {
        self.gpu().is_ok_and(|gpu| gpu.timer.running.is_some())
    }

    /// Whether the timer uses device timestamps rather than the host clock.
    #[must_use]
    pub fn has_device_timer(&self) -> bool {
        self.gpu().is_ok_and(|gpu| gpu.timer.device_timed)
    }
}
