//! Content-pattern detector that suppresses caching of build-tool depfiles.

/// Byte sequence that identifies a GCC-style `.d` depfile: `.o: ` followed
/// by a line continuation backslash.
const DEPFILE_MARKER: &[u8] = b".o: \\";

/// Bodies at or under this size are eligible for the depfile check. Larger
/// bodies are assumed not to be depfiles and pass through unfiltered.
const MAX_DEPFILE_BYTES: usize = 100_000;

/// Returns whether `body` should be blocked as a GCC depfile: it is no
/// larger than [`MAX_DEPFILE_BYTES`] and contains [`DEPFILE_MARKER`]
/// anywhere. The caller is expected to only invoke this when
/// `allowGccDepfiles` is false.
pub fn is_blocked_gcc_depfile(body: &[u8]) -> bool {
    body.len() <= MAX_DEPFILE_BYTES
        && body
            .windows(DEPFILE_MARKER.len())
            .any(|window| window == DEPFILE_MARKER)
}
