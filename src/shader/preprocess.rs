//! Shader Define Injection
//!
//! Pure text transformation that splices `#define` directives into GLSL
//! source before it reaches the front end.
//!
//! Each entry of the define list is a raw directive body (`"FACTOR 10"`,
//! `"USE_SHARED"`) and becomes one `#define <body>` line, in list order.
//! The block is inserted directly after the line containing the `#version`
//! marker; when no such line exists (or the marker has no line terminator)
//! the block is prepended instead. The remainder of the source is copied
//! unmodified.
//!
//! No validation of the macro text happens here. A malformed entry surfaces
//! later as a compile error from the front end.
//!
//! ```rust,ignore
//! use myth_compute::shader::inject_defines;
//!
//! let src = "#version 450\nvoid main() {}\n";
//! let out = inject_defines(src, &["A", "B 2"]);
//! assert_eq!(out, "#version 450\n#define A\n#define B 2\nvoid main() {}\n");
//! ```

/// Marker that identifies the preamble line.
pub const VERSION_MARKER: &str = "#version";

const DEFINE_PREFIX: &str = "#define ";

/// Returns `source` with one `#define` line per entry of `defines` inserted
/// after the `#version` line (or prepended when there is none).
#[must_use]
pub fn inject_defines<S: AsRef<str>>(source: &str, defines: &[S]) -> String {
    let extra: usize = defines
        .iter()
        .map(|d| DEFINE_PREFIX.len() + d.as_ref().len() + 1)
        .sum();
    let mut out = String::with_capacity(source.len() + extra);

    let split = preamble_end(source);
    let (head, tail) = source.split_at(split.unwrap_or(0));

    out.push_str(head);
    for define in defines {
        out.push_str(DEFINE_PREFIX);
        out.push_str(define.as_ref());
        out.push('\n');
    }
    out.push_str(tail);
    out
}

/// Byte index just past the terminator of the `#version` line.
fn preamble_end(source: &str) -> Option<usize> {
    let start = source.find(VERSION_MARKER)?;
    let newline = source[start..].find('\n')?;
    Some(start + newline + 1)
}
