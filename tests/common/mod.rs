//! Shared helpers for `myth-compute` integration tests.
//!
//! Tests that need a device call [`context`]. When no adapter is available the
//! test is skipped, unless `MYTH_COMPUTE_REQUIRE_GPU` is truthy, in which case
//! it fails.

#![allow(dead_code)]

use myth_compute::{ComputeContext, ComputeSettings, ErrorKind};

pub const REQUIRE_GPU_ENV: &str = "MYTH_COMPUTE_REQUIRE_GPU";

pub fn require_gpu() -> bool {
    let Ok(raw) = std::env::var(REQUIRE_GPU_ENV) else {
        return false;
    };

    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

pub fn skip_or_panic(test_name: &str, reason: &str) {
    if require_gpu() {
        panic!("{REQUIRE_GPU_ENV} is enabled but {test_name} cannot run: {reason}");
    }
    eprintln!("skipping {test_name}: {reason}");
}

/// An initialized context, or `None` when the test should be skipped.
pub fn context(test_name: &str) -> Option<ComputeContext> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut ctx = ComputeContext::with_settings(ComputeSettings::from_env());
    match ctx.init(4, 3) {
        Ok(()) => Some(ctx),
        Err(err) if err.kind() == ErrorKind::Init => {
            skip_or_panic(test_name, &err.to_string());
            None
        }
        Err(err) => panic!("unexpected init failure: {err}"),
    }
}

/// A unique path in the temp directory for kernel files.
pub fn temp_kernel_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("myth-compute-{}-{name}.comp", std::process::id()))
}

pub const REDUCE_KERNEL: &str = r"#version 450
layout(local_size_x = 256) in;
layout(std430, binding = 0) readonly buffer Input { float values[]; };
layout(std430, binding = 1) buffer Partials { float partial[]; };

shared float scratch[256];

void main() {
    uint lid = gl_LocalInvocationID.x;
    scratch[lid] = values[gl_GlobalInvocationID.x];
    barrier();

    for (uint stride = 128u; stride > 0u; stride = stride / 2u) {
        if (lid < stride) {
            scratch[lid] += scratch[lid + stride];
        }
        barrier();
    }

    if (lid == 0u) {
        partial[gl_WorkGroupID.x] = scratch[0];
    }
}
";

/// Work-efficient exclusive scan of 512 ints in one work group.
pub const SCAN_KERNEL: &str = r"#version 450
layout(local_size_x = 256) in;
layout(std430, binding = 0) readonly buffer Input { int data_in[]; };
layout(std430, binding = 1) buffer Output { int data_out[]; };

shared int temp[512];

void main() {
    uint tid = gl_LocalInvocationID.x;
    uint n = 512u;

    temp[2u * tid] = data_in[2u * tid];
    temp[2u * tid + 1u] = data_in[2u * tid + 1u];

    uint offset = 1u;
    for (uint d = n / 2u; d > 0u; d = d / 2u) {
        barrier();
        if (tid < d) {
            uint ai = offset * (2u * tid + 1u) - 1u;
            uint bi = offset * (2u * tid + 2u) - 1u;
            temp[bi] += temp[ai];
        }
        offset = offset * 2u;
    }

    if (tid == 0u) {
        temp[n - 1u] = 0;
    }

    for (uint d = 1u; d < n; d = d * 2u) {
        offset = offset / 2u;
        barrier();
        if (tid < d) {
            uint ai = offset * (2u * tid + 1u) - 1u;
            uint bi = offset * (2u * tid + 2u) - 1u;
            int t = temp[ai];
            temp[ai] = temp[bi];
            temp[bi] += t;
        }
    }
    barrier();

    data_out[2u * tid] = temp[2u * tid];
    data_out[2u * tid + 1u] = temp[2u * tid + 1u];
}
";

pub const SCALE_KERNEL: &str = r"#version 450
layout(local_size_x = 64) in;
layout(std430, binding = 0) buffer Data { float values[]; };
layout(std140, binding = 1) uniform Params { float factor; uint count; } params;

void main() {
    uint i = gl_GlobalInvocationID.x;
    if (i < params.count) {
        values[i] *= params.factor;
    }
}
";

/// Writes `VALUE` (a define) into every element.
pub const FILL_KERNEL: &str = r"#version 450
layout(local_size_x = 64) in;
layout(std430, binding = 0) buffer Data { float values[]; };

void main() {
    values[gl_GlobalInvocationID.x] = float(VALUE);
}
";

pub const DOUBLE_IMAGE_KERNEL: &str = r"#version 450
layout(local_size_x = 8, local_size_y = 8) in;
layout(r32f, binding = 0) uniform image2D img;

void main() {
    ivec2 p = ivec2(gl_GlobalInvocationID.xy);
    imageStore(img, p, imageLoad(img, p) * 2.0);
}
";
