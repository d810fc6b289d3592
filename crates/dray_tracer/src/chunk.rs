//! Work partitioning for chunked parallel routing.
//!
//! Ray buffers are cut into contiguous chunks, both across worker threads
//! and across ranks (the image schedule's camera-ray split).

use std::ops::Range;

/// Lower bound on a routing chunk: rays are intersected this many at a time.
pub const SIMD_WIDTH: usize = 16;

/// Chunks per thread; more than one so the pool can balance uneven chunks.
const CHUNKS_PER_THREAD: usize = 4;

/// Chunk size for routing `len` rays on `threads` workers.
///
/// Never below `SIMD_WIDTH`, never above `len / threads` once there are
/// enough rays to give every worker a full chunk.
pub fn chunk_size(len: usize, threads: usize) -> usize {
    let threads = threads.max(1);
    (len / (threads * CHUNKS_PER_THREAD)).max(SIMD_WIDTH)
}

/// Contiguous slice of `len` items owned by `rank` out of `world_size`.
///
/// Slices are equal-sized; the last rank also takes the remainder so no
/// item is left out.
pub fn rank_slice(len: usize, rank: usize, world_size: usize) -> Range<usize> {
    let world_size = world_size.max(1);
    let chunk = len / world_size;
    let start = (chunk * rank).min(len);
    let end = if rank + 1 >= world_size {
        len
    } else {
        (chunk * (rank + 1)).min(len)
    };
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_lower_bound() {
        assert_eq!(chunk_size(0, 8), SIMD_WIDTH);
        assert_eq!(chunk_size(100, 8), SIMD_WIDTH);
        assert_eq!(chunk_size(100, 0), SIMD_WIDTH);
    }

    #[test]
    fn test_chunk_size_upper_bound() {
        let len = 1_000_000;
        for threads in [1, 2, 7, 64] {
            let size = chunk_size(len, threads);
            assert!(size >= SIMD_WIDTH);
            assert!(size <= len / threads);
        }
    }

    #[test]
    fn test_rank_slices_cover_everything() {
        let len = 100;
        let world = 3;
        let slices: Vec<_> = (0..world).map(|r| rank_slice(len, r, world)).collect();

        assert_eq!(slices[0], 0..33);
        assert_eq!(slices[1], 33..66);
        assert_eq!(slices[2], 66..100);

        let total: usize = slices.iter().map(|s| s.len()).sum();
        assert_eq!(total, len);
    }

    #[test]
    fn test_rank_slice_single_rank() {
        assert_eq!(rank_slice(100, 0, 1), 0..100);
    }

    #[test]
    fn test_rank_slice_more_ranks_than_items() {
        let slices: Vec<_> = (0..4).map(|r| rank_slice(2, r, 4)).collect();
        assert_eq!(slices, vec![0..0, 0..0, 0..0, 0..2]);
    }
}
