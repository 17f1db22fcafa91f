//! Chunk arithmetic for a file of `size` bytes split into `chunk_size` slices.

use std::ops::RangeInclusive;

/// Default chunk size (256 KiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;

/// Largest file size whose chunk indices fit in a `u32`.
pub fn max_file_size(chunk_size: u32) -> u64 {
    chunk_size as u64 * u32::MAX as u64
}

/// Chunk indices overlapped by the byte range `[offset, offset + len)`.
///
/// `None` for an empty range (a zero-length write touches no chunk) and for
/// a range reaching past `max_file_size`.
pub fn chunk_span(offset: u64, len: u64, chunk_size: u32) -> Option<RangeInclusive<u32>> {
    if len == 0 {
        return None;
    }
    let c = chunk_size as u64;
    let end = offset.checked_add(len)?;
    if end > max_file_size(chunk_size) {
        return None;
    }
    Some((offset / c) as u32..=((end - 1) / c) as u32)
}

/// Number of chunks a file of `size` bytes occupies, or `None` when the
/// count does not fit the chunk index space.
pub fn chunk_count(size: u64, chunk_size: u32) -> Option<u32> {
    u32::try_from(size.div_ceil(chunk_size as u64)).ok()
}

/// File offset at which chunk `index` starts.
pub fn chunk_offset(index: u32, chunk_size: u32) -> u64 {
    index as u64 * chunk_size as u64
}

/// Plaintext length of chunk `index` in a file of `size` bytes.
pub fn chunk_len(index: u32, size: u64, chunk_size: u32) -> u64 {
    let start = chunk_offset(index, chunk_size);
    size.saturating_sub(start).min(chunk_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_vec(offset: u64, len: u64, c: u32) -> Vec<u32> {
        chunk_span(offset, len, c).map(|r| r.collect()).unwrap_or_default()
    }

    #[test]
    fn test_span_matches_floor_division() {
        for c in [1u32, 3, 16, 4096] {
            for offset in [0u64, 1, 15, 16, 17, 4095, 9000] {
                for len in [1u64, 2, 16, 100, 5000] {
                    let expected: Vec<u32> =
                        ((offset / c as u64) as u32..=((offset + len - 1) / c as u64) as u32).collect();
                    assert_eq!(span_vec(offset, len, c), expected);
                }
            }
        }
    }

    #[test]
    fn test_span_within_one_chunk() {
        assert_eq!(span_vec(10, 5, 16), vec![0]);
        assert_eq!(span_vec(16, 16, 16), vec![1]);
    }

    #[test]
    fn test_span_crossing_boundary() {
        assert_eq!(span_vec(15, 2, 16), vec![0, 1]);
        assert_eq!(span_vec(0, 33, 16), vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_write_touches_nothing() {
        assert!(chunk_span(100, 0, 16).is_none());
    }

    #[test]
    fn test_sparse_write_at_70000() {
        let c = 65_536;
        assert_eq!(span_vec(70_000, 10, c), vec![1]);
        assert_eq!(chunk_count(70_010, c), Some(2));
        assert_eq!(chunk_len(0, 70_010, c), 65_536);
        assert_eq!(chunk_len(1, 70_010, c), 4_474);
        assert_eq!(70_000 - chunk_offset(1, c), 4_464);
    }

    #[test]
    fn test_count_and_len() {
        assert_eq!(chunk_count(0, 16), Some(0));
        assert_eq!(chunk_count(16, 16), Some(1));
        assert_eq!(chunk_count(17, 16), Some(2));
        assert_eq!(chunk_len(1, 17, 16), 1);
        assert_eq!(chunk_len(2, 17, 16), 0);
    }

    #[test]
    fn test_count_beyond_index_space() {
        let limit = max_file_size(16);
        assert_eq!(chunk_count(limit, 16), Some(u32::MAX));
        assert_eq!(chunk_count(limit + 1, 16), None);
        assert_eq!(chunk_count(1 << 40, 1), None);
        assert!(chunk_span(limit - 1, 1, 16).is_some());
        assert!(chunk_span(limit, 1, 16).is_none());
        assert!(chunk_span(u64::MAX, 2, 16).is_none());
    }
}
