//! Chunk planning: split an object size into part start offsets.

/// Hard limit on multipart part count imposed by object stores.
pub const MAX_PARTS: i64 = 10_000;

/// Ordered byte-range plan for one object.
///
/// Deterministic for a given `(size, chunk_size)` input, which is what makes
/// resume possible: part numbers computed on a fresh attempt line up with the
/// parts committed by a crashed predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Start offset of each part, ascending. Part number `n` covers the range
    /// starting at `offsets[n - 1]`.
    pub offsets: Vec<i64>,
    /// Effective chunk size, possibly enlarged from the requested one to stay
    /// under [`MAX_PARTS`].
    pub chunk_size: i64,
}

impl ChunkPlan {
    /// Total number of parts in the plan.
    pub fn total_parts(&self) -> usize {
        self.offsets.len()
    }

    /// Inclusive byte range `(start, end)` for the part starting at `offset`.
    pub fn part_range(&self, offset: i64, size: i64) -> (i64, i64) {
        let end = (offset + self.chunk_size).min(size) - 1;
        (offset, end)
    }
}

/// Split `size` bytes into part start offsets of `chunk_size` each.
///
/// If the naive split would exceed [`MAX_PARTS`], the chunk size is enlarged
/// to `size / 10000 + 1024` (the extra 1024 guarantees headroom under the
/// limit). The loop condition is strictly `<` so an exactly-divisible size
/// does not produce a trailing empty part.
pub fn plan(size: i64, chunk_size: i64) -> ChunkPlan {
    let mut effective = chunk_size;
    if size / effective + 1 > MAX_PARTS {
        effective = size / MAX_PARTS + 1024;
        tracing::info!(
            "Size {} exceeds {} part limit, chunk size adjusted to {}",
            size,
            MAX_PARTS,
            effective
        );
    }

    let mut offsets = vec![0i64];
    let mut part = 1i64;
    while effective * part < size {
        offsets.push(effective * part);
        part += 1;
    }

    ChunkPlan {
        offsets,
        chunk_size: effective,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: i64 = 1024 * 1024;

    #[test]
    fn test_plan_25mb_in_10mb_chunks() {
        let p = plan(25 * MB, 10 * MB);
        assert_eq!(p.offsets, vec![0, 10 * MB, 20 * MB]);
        assert_eq!(p.chunk_size, 10 * MB);
        assert_eq!(p.total_parts(), 3);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = plan(123_456_789, 5 * MB);
        let b = plan(123_456_789, 5 * MB);
        assert_eq!(a, b);
    }

    #[test]
    fn test_exact_division_has_no_empty_tail() {
        let p = plan(20 * MB, 10 * MB);
        assert_eq!(p.offsets, vec![0, 10 * MB]);
    }

    #[test]
    fn test_zero_size_yields_single_chunk() {
        let p = plan(0, 5 * MB);
        assert_eq!(p.offsets, vec![0]);
    }

    #[test]
    fn test_size_smaller_than_chunk() {
        let p = plan(100, 5 * MB);
        assert_eq!(p.offsets, vec![0]);
    }

    #[test]
    fn test_part_limit_auto_enlarges_chunk() {
        // 100 GiB in 5 MiB chunks would be 20480 parts
        let size = 100 * 1024 * MB;
        let p = plan(size, 5 * MB);
        assert!(p.chunk_size > 5 * MB);
        assert!(p.total_parts() as i64 <= MAX_PARTS);
        // ceil(size / effective) stays under the cap
        assert!((size + p.chunk_size - 1) / p.chunk_size <= MAX_PARTS);
    }

    #[test]
    fn test_part_range_clamps_last_part() {
        let p = plan(25 * MB, 10 * MB);
        assert_eq!(p.part_range(0, 25 * MB), (0, 10 * MB - 1));
        assert_eq!(p.part_range(20 * MB, 25 * MB), (20 * MB, 25 * MB - 1));
    }
}
