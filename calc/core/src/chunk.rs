//! Splits work into balanced chunks for the worker pool.

use std::ops::Range;

/* min_chunk_size does not guarantee every chunk ends up >= min_chunk_size:
 * split_range(1, 10, 2, 6) yields {(1,6), (7,10)} rather than the single
 * {(1,10)} strict enforcement would give. Since the split exists to feed
 * parallelism, more chunks beat strictly honored minimums. */

/// Splits the inclusive range `[x_from, x_to]` into contiguous, disjoint,
/// ascending sub-ranges. Invalid arguments yield an empty plan, which
/// callers treat as a completed no-op.
///
/// With few elements the plan holds `total / min_chunk_size` chunks of
/// exactly `min_chunk_size` plus a smaller trailing chunk; once that would
/// exceed `max_chunk_count`, exactly `max_chunk_count` chunks are produced
/// with sizes differing by at most one.
pub fn split_range(
    x_from: i32,
    x_to: i32,
    max_chunk_count: i32,
    min_chunk_size: i32,
) -> Vec<(i32, i32)> {
    if x_from > x_to || max_chunk_count <= 0 || min_chunk_size < 1 {
        return Vec::new();
    }
    if max_chunk_count == 1 {
        return vec![(x_from, x_to)];
    }

    // 64-bit so the full i32 range does not overflow the element count.
    let total = i64::from(x_to) - i64::from(x_from) + 1;
    let min_size = i64::from(min_chunk_size);

    let mut chunks = Vec::new();
    let chunk_count = total / min_size;
    let remainder = total % min_size;

    if chunk_count + if remainder != 0 { 1 } else { 0 } <= i64::from(max_chunk_count) {
        let mut current = i64::from(x_from);
        for _ in 0..chunk_count {
            chunks.push((current as i32, (current + min_size - 1) as i32));
            current += min_size;
        }
        if remainder != 0 {
            chunks.push((current as i32, (current + remainder - 1) as i32));
        }
    } else {
        let count = i64::from(max_chunk_count);
        let remainder = total % count;
        let base_size = total / count;
        let mut current = i64::from(x_from);
        for index in 0..count {
            let size = base_size + if index < remainder { 1 } else { 0 };
            chunks.push((current as i32, (current + size - 1) as i32));
            current += size;
        }
    }
    chunks
}

/// Index-range form of [`split_range`] for slicing sequences.
pub fn split_slice(len: usize, max_chunk_count: i32, min_chunk_size: i32) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    debug_assert!(len <= i32::max_value() as usize);
    split_range(0, (len - 1) as i32, max_chunk_count, min_chunk_size)
        .into_iter()
        .map(|(start, end)| start as usize..end as usize + 1)
        .collect()
}
