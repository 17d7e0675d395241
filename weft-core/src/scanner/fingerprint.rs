//! File fingerprinting for parse short-circuiting.
//!
//! Small files get a CRC32 over their full content. Large files get a
//! hierarchical fingerprint combining size, mtime, and CRC32s over fixed
//! sample windows (head, tail, and evenly spaced interior windows), so a
//! multi-megabyte template never has to be fully read just to discover it
//! has not changed. Fingerprints are opaque strings; only equality matters.

use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Files at or below this size are fingerprinted over their full content.
pub const FULL_CRC_LIMIT: u64 = 1024 * 1024;

/// Size of each sample window for large files.
const WINDOW: u64 = 4096;

/// Interior windows between the head and tail samples.
const INTERIOR_WINDOWS: u64 = 4;

/// Fingerprint for content that is already in memory.
pub fn fingerprint_content(content: &[u8]) -> String {
    format!("crc32:{:08x}", crc32fast::hash(content))
}

/// Hierarchical fingerprint for files larger than [`FULL_CRC_LIMIT`]. Reads
/// only the sample windows from `file`; the caller keeps the single open
/// handle. `mtime_secs` is folded in so equal-size rewrites are still
/// distinguished even when every sampled window agrees.
pub async fn fingerprint_large(
    file: &mut File,
    size: u64,
    mtime_secs: i64,
) -> std::io::Result<String> {
    debug_assert!(size > FULL_CRC_LIMIT);

    let mut combined = crc32fast::Hasher::new();
    combined.update(&size.to_le_bytes());
    combined.update(&mtime_secs.to_le_bytes());

    let mut buf = vec![0u8; WINDOW as usize];
    for offset in sample_offsets(size) {
        file.seek(SeekFrom::Start(offset)).await?;
        let want = WINDOW.min(size - offset) as usize;
        file.read_exact(&mut buf[..want]).await?;
        let window_crc = crc32fast::hash(&buf[..want]);
        combined.update(&window_crc.to_le_bytes());
    }

    Ok(format!("hier:{:x}:{:08x}", size, combined.finalize()))
}

/// Head, evenly spaced interior windows, then tail.
fn sample_offsets(size: u64) -> Vec<u64> {
    let mut offsets = vec![0];
    let interior_span = size.saturating_sub(2 * WINDOW);
    let stride = interior_span / (INTERIOR_WINDOWS + 1);
    for i in 1..=INTERIOR_WINDOWS {
        offsets.push(WINDOW + stride * i);
    }
    offsets.push(size - WINDOW);
    offsets
}
