//! Dispatch Tests
//!
//! Tests for:
//! - Kernels: parallel reduction, work-efficient scan
//! - Uniforms: setters, type checking, unresolved names
//! - Bind cache: program binds and bind group rebuilds
//! - Validation: missing program, missing, undersized and oversized bindings, grid limits
//! - Async readback: matches the blocking read, single outstanding request, timeouts

mod common;

use std::time::Duration;

use myth_compute::prelude::*;

const ELEMENTS: usize = 1024;
const LOCAL_SIZE: usize = 256;

/// Compiles the reduction kernel and binds 1024 ones plus the partial sums.
fn setup_reduction(ctx: &mut ComputeContext) -> BufferHandle {
    let program = ctx.compile(common::REDUCE_KERNEL).unwrap();
    let input = ctx
        .create_buffer_from_slice(&[1.0f32; ELEMENTS], BufferUsage::Static)
        .unwrap();
    let partials = ctx.create_zero_buffer((ELEMENTS / LOCAL_SIZE * 4) as u64).unwrap();
    ctx.bind_buffer(input, 0).unwrap();
    ctx.bind_buffer(partials, 1).unwrap();
    ctx.set_active_program(program).unwrap();
    partials
}

// ============================================================================
// Kernels
// ============================================================================

#[test]
fn reduction_produces_partial_sums() {
    let Some(mut ctx) = common::context("reduction_produces_partial_sums") else {
        return;
    };

    let partials = setup_reduction(&mut ctx);
    ctx.dispatch_1d((ELEMENTS / LOCAL_SIZE) as u32).unwrap();

    let sums: Vec<f32> = ctx.read_buffer_as(partials, ELEMENTS / LOCAL_SIZE).unwrap();
    assert_eq!(sums, vec![256.0; 4]);
    assert_eq!(sums.iter().sum::<f32>(), ELEMENTS as f32);
}

#[test]
fn exclusive_scan_of_ones_yields_indices() -> anyhow::Result<()> {
    let Some(mut ctx) = common::context("exclusive_scan_of_ones_yields_indices") else {
        return Ok(());
    };

    let program = ctx.compile(common::SCAN_KERNEL)?;
    let input = ctx.create_buffer_from_slice(&[1i32; 512], BufferUsage::Static)?;
    let output = ctx.create_zero_buffer(512 * 4)?;
    ctx.bind_buffer(input, 0)?;
    ctx.bind_buffer(output, 1)?;
    ctx.set_active_program(program)?;
    ctx.dispatch_1d(1)?;

    let scanned: Vec<i32> = ctx.read_buffer_as(output, 512)?;
    let expected: Vec<i32> = (0..512).collect();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn enqueued_dispatches_run_in_order() {
    let Some(mut ctx) = common::context("enqueued_dispatches_run_in_order") else {
        return;
    };

    let program = ctx.compile(common::SCALE_KERNEL).unwrap();
    let data = ctx.create_buffer_from_slice(&[1.0f32; 64], BufferUsage::Dynamic).unwrap();
    ctx.bind_buffer(data, 0).unwrap();
    ctx.set_active_program(program).unwrap();
    ctx.set_uniform_uint("count", 64).unwrap();
    ctx.set_uniform_float("factor", 2.0).unwrap();

    ctx.enqueue_dispatch(1, 1, 1).unwrap();
    ctx.enqueue_dispatch(1, 1, 1).unwrap();
    // Changing a uniform must not affect the work already recorded.
    ctx.set_uniform_float("factor", 3.0).unwrap();
    ctx.enqueue_dispatch(1, 1, 1).unwrap();
    ctx.barrier(BarrierFlags::STORAGE_BUFFER).unwrap();

    let values: Vec<f32> = ctx.read_buffer_as(data, 64).unwrap();
    assert!(values.iter().all(|&v| v == 12.0), "{values:?}");
}

// ============================================================================
// Uniforms and Bind Cache
// ============================================================================

#[test]
fn uniforms_reach_the_kernel_and_binds_are_cached() {
    let Some(mut ctx) = common::context("uniforms_reach_the_kernel_and_binds_are_cached") else {
        return;
    };

    let program = ctx.compile(common::SCALE_KERNEL).unwrap();
    let data = ctx.create_buffer_from_slice(&[1.0f32; 64], BufferUsage::Dynamic).unwrap();
    ctx.bind_buffer(data, 0).unwrap();
    ctx.set_active_program(program).unwrap();

    ctx.set_uniform_float("factor", 3.0).unwrap();
    ctx.set_uniform_uint("params.count", 32).unwrap();
    ctx.dispatch_1d(1).unwrap();

    let values: Vec<f32> = ctx.read_buffer_as(data, 64).unwrap();
    assert!(values[..32].iter().all(|&v| v == 3.0));
    assert!(values[32..].iter().all(|&v| v == 1.0));

    ctx.set_uniform_float("factor", 2.0).unwrap();
    ctx.dispatch_1d(1).unwrap();
    let values: Vec<f32> = ctx.read_buffer_as(data, 64).unwrap();
    assert!(values[..32].iter().all(|&v| v == 6.0));

    let stats = ctx.dispatch_stats().unwrap();
    assert_eq!(stats.program_binds, 1);
    assert_eq!(stats.bind_group_builds, 1);
    assert_eq!(stats.dispatches, 2);

    // Rebinding invalidates the bind group but not the program.
    ctx.bind_buffer(data, 0).unwrap();
    ctx.dispatch_1d(1).unwrap();
    let stats = ctx.dispatch_stats().unwrap();
    assert_eq!(stats.program_binds, 1);
    assert_eq!(stats.bind_group_builds, 2);
}

#[test]
fn switching_programs_rebinds() {
    let Some(mut ctx) = common::context("switching_programs_rebinds") else {
        return;
    };

    let scale = ctx.compile(common::SCALE_KERNEL).unwrap();
    let fill = ctx.compile_with_defines(common::FILL_KERNEL, &["VALUE 5"]).unwrap();
    let data = ctx.create_zero_buffer(64 * 4).unwrap();
    ctx.bind_buffer(data, 0).unwrap();

    ctx.set_active_program(fill).unwrap();
    ctx.dispatch_1d(1).unwrap();
    ctx.set_active_program(scale).unwrap();
    ctx.set_uniform_uint("count", 64).unwrap();
    ctx.set_uniform_float("factor", 0.5).unwrap();
    ctx.dispatch_1d(1).unwrap();

    let values: Vec<f32> = ctx.read_buffer_as(data, 64).unwrap();
    assert!(values.iter().all(|&v| v == 2.5));
    assert_eq!(ctx.dispatch_stats().unwrap().program_binds, 2);
}

#[test]
fn uniform_type_mismatch_is_rejected() {
    let Some(mut ctx) = common::context("uniform_type_mismatch_is_rejected") else {
        return;
    };

    let program = ctx.compile(common::SCALE_KERNEL).unwrap();
    ctx.set_active_program(program).unwrap();

    let err = ctx.set_uniform_int("factor", 1).unwrap_err();
    assert!(matches!(
        err,
        ComputeError::UniformTypeMismatch { declared: "float", provided: "int", .. }
    ));
    assert!(ctx.set_uniform_vec4("count", Vec4::ONE).is_err());
}

#[test]
fn unresolved_uniform_is_ignored() {
    let Some(mut ctx) = common::context("unresolved_uniform_is_ignored") else {
        return;
    };

    let program = ctx.compile(common::SCALE_KERNEL).unwrap();
    ctx.set_active_program(program).unwrap();
    ctx.set_debug_logging(true);

    ctx.set_uniform_float("no_such_uniform", 1.0).unwrap();
    ctx.set_uniform_mat4("params.missing", Mat4::IDENTITY).unwrap();
    assert!(ctx.last_error().is_none());
}

#[test]
fn uniform_without_active_program_is_a_state_error() {
    let Some(mut ctx) = common::context("uniform_without_active_program_is_a_state_error") else {
        return;
    };

    let err = ctx.set_uniform_float("factor", 1.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn dispatch_without_program_fails() {
    let Some(mut ctx) = common::context("dispatch_without_program_fails") else {
        return;
    };

    let err = ctx.dispatch(1, 1, 1).unwrap_err();
    assert!(matches!(err, ComputeError::InvalidState(_)));
    assert!(ctx.last_error().is_some());
    assert_eq!(ctx.dispatch_stats().unwrap().dispatches, 0);
}

#[test]
fn missing_binding_is_reported() {
    let Some(mut ctx) = common::context("missing_binding_is_reported") else {
        return;
    };

    let program = ctx.compile(common::REDUCE_KERNEL).unwrap();
    let input = ctx.create_zero_buffer((ELEMENTS * 4) as u64).unwrap();
    ctx.bind_buffer(input, 0).unwrap();
    ctx.set_active_program(program).unwrap();

    let err = ctx.dispatch_1d(1).unwrap_err();
    assert!(matches!(err, ComputeError::BindingMismatch { binding: 1, .. }));
}

#[test]
fn destroyed_binding_is_reported() {
    let Some(mut ctx) = common::context("destroyed_binding_is_reported") else {
        return;
    };

    let partials = setup_reduction(&mut ctx);
    ctx.dispatch_1d(4).unwrap();
    ctx.destroy_buffer(partials);

    let err = ctx.dispatch_1d(4).unwrap_err();
    assert!(matches!(err, ComputeError::BindingMismatch { binding: 1, .. }));
}

#[test]
fn buffer_beyond_binding_limit_is_reported() {
    let Some(mut ctx) = common::context("buffer_beyond_binding_limit_is_reported") else {
        return;
    };
    let limits = ctx.limits().unwrap();
    let size = limits.max_storage_binding_size + 256;
    // Only testable where such a buffer can be allocated cheaply.
    if size > limits.max_buffer_size || size > 512 << 20 {
        return;
    }

    let program = ctx.compile(common::REDUCE_KERNEL).unwrap();
    let input = ctx.create_zero_buffer(size).unwrap();
    let partials = ctx.create_zero_buffer(16).unwrap();
    ctx.bind_buffer(input, 0).unwrap();
    ctx.bind_buffer(partials, 1).unwrap();
    ctx.set_active_program(program).unwrap();

    let err = ctx.dispatch_1d(1).unwrap_err();
    assert!(matches!(err, ComputeError::BindingMismatch { binding: 0, .. }));
}

#[test]
fn read_only_and_read_write_aliasing_is_rejected() {
    let Some(mut ctx) = common::context("read_only_and_read_write_aliasing_is_rejected") else {
        return;
    };

    let program = ctx.compile(common::REDUCE_KERNEL).unwrap();
    let shared = ctx.create_zero_buffer((ELEMENTS * 4) as u64).unwrap();
    ctx.bind_buffer(shared, 0).unwrap();
    ctx.bind_buffer(shared, 1).unwrap();
    ctx.set_active_program(program).unwrap();

    assert_eq!(ctx.dispatch_1d(1).unwrap_err().kind(), ErrorKind::Resource);
}

#[test]
fn oversized_grid_is_rejected() {
    let Some(mut ctx) = common::context("oversized_grid_is_rejected") else {
        return;
    };

    setup_reduction(&mut ctx);
    let max = ctx.limits().unwrap().max_group_count[0];
    let err = ctx.dispatch(max + 1, 1, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(ctx.dispatch_stats().unwrap().dispatches, 0);
}

// ============================================================================
// Async Readback
// ============================================================================

#[test]
fn async_read_matches_blocking_read() {
    let Some(mut ctx) = common::context("async_read_matches_blocking_read") else {
        return;
    };

    let partials = setup_reduction(&mut ctx);
    ctx.dispatch_1d(4).unwrap();

    ctx.read_async(partials, 16, 0).unwrap();
    assert!(ctx.has_pending_read());
    let async_bytes = ctx.wait_async().unwrap().expect("a read was pending");
    assert!(!ctx.has_pending_read());

    assert_eq!(async_bytes, ctx.read_buffer(partials, 16).unwrap());
    let sums: Vec<f32> = bytemuck::pod_collect_to_vec(&async_bytes);
    assert_eq!(sums, vec![256.0; 4]);
}

#[test]
fn async_read_with_offset() -> anyhow::Result<()> {
    let Some(mut ctx) = common::context("async_read_with_offset") else {
        return Ok(());
    };

    let data: Vec<u32> = (0..64).collect();
    let handle = ctx.create_buffer_from_slice(&data, BufferUsage::Dynamic)?;
    ctx.read_async(handle, 8, 40)?;
    let bytes = ctx
        .wait_async_timeout(Duration::from_secs(5))?
        .ok_or_else(|| anyhow::anyhow!("no read was pending"))?;
    let words: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
    assert_eq!(words, vec![10, 11]);
    Ok(())
}

#[test]
fn wait_without_request_returns_nothing() {
    let Some(mut ctx) = common::context("wait_without_request_returns_nothing") else {
        return;
    };

    assert!(ctx.wait_async().unwrap().is_none());
}

#[test]
fn timed_out_wait_releases_the_fence() {
    let Some(mut ctx) = common::context("timed_out_wait_releases_the_fence") else {
        return;
    };

    let partials = setup_reduction(&mut ctx);
    ctx.dispatch_1d(4).unwrap();
    ctx.read_async(partials, 16, 0).unwrap();

    // A fast device may finish within a zero timeout.
    match ctx.wait_async_timeout(Duration::ZERO) {
        Ok(bytes) => assert_eq!(bytes.map(|b| b.len()), Some(16)),
        Err(err) => assert_eq!(err.kind(), ErrorKind::SyncTimeout),
    }
    assert!(!ctx.has_pending_read());
    assert!(ctx.wait_async().unwrap().is_none());
}

#[test]
fn invalid_async_reads_are_rejected() {
    let Some(mut ctx) = common::context("invalid_async_reads_are_rejected") else {
        return;
    };

    let handle = ctx.create_zero_buffer(16).unwrap();
    assert_eq!(ctx.read_async(handle, 0, 0).unwrap_err().kind(), ErrorKind::Resource);
    assert_eq!(ctx.read_async(handle, 16, 8).unwrap_err().kind(), ErrorKind::Bounds);
    assert!(!ctx.has_pending_read());
}
