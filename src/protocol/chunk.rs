//! Splitting serialized values into transport-sized chunks.
//!
//! Both peers derive chunk boundaries from the total size and a shared
//! bound, so a chunk is identified by its index alone.

use bytes::Bytes;

/// Number of chunks needed to carry `total_bytes` with chunks of at most `bound` bytes.
pub fn chunk_count(total_bytes: u64, bound: usize) -> u32 {
    if bound == 0 {
        return 0;
    }
    total_bytes.div_ceil(bound as u64) as u32
}

/// Expected length of chunk `index`, or 0 when the index is out of range.
pub fn chunk_len(total_bytes: u64, index: u32, bound: usize) -> usize {
    let start = index as u64 * bound as u64;
    if start >= total_bytes {
        return 0;
    }
    (total_bytes - start).min(bound as u64) as usize
}

/// Slice chunk `index` out of `buffer`. Out-of-range indices yield an empty slice.
pub fn get_chunk(buffer: &[u8], index: u32, bound: usize) -> &[u8] {
    let start = index as usize * bound;
    if bound == 0 || start >= buffer.len() {
        return &[];
    }
    let end = (start + bound).min(buffer.len());
    &buffer[start..end]
}

/// [`get_chunk`] over a shared buffer, without copying.
pub fn get_chunk_bytes(buffer: &Bytes, index: u32, bound: usize) -> Bytes {
    buffer.slice_ref(get_chunk(buffer, index, bound))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 10), 0);
        assert_eq!(chunk_count(1, 10), 1);
        assert_eq!(chunk_count(10, 10), 1);
        assert_eq!(chunk_count(11, 10), 2);
        assert_eq!(chunk_count(100, 0), 0);
    }

    #[test]
    fn test_chunks_reconstruct_buffer() {
        let buffer: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        for bound in [1, 7, 64, 999, 1000, 4096] {
            let count = chunk_count(buffer.len() as u64, bound);
            let mut rebuilt = Vec::new();
            for index in 0..count {
                let chunk = get_chunk(&buffer, index, bound);
                assert_eq!(chunk.len(), chunk_len(buffer.len() as u64, index, bound));
                rebuilt.extend_from_slice(chunk);
            }
            assert_eq!(rebuilt, buffer, "bound {bound}");
            assert!(get_chunk(&buffer, count, bound).is_empty());
        }
    }

    #[test]
    fn test_out_of_range_chunk_is_empty() {
        let buffer = [1u8; 25];
        assert_eq!(get_chunk(&buffer, 2, 10), &[1u8; 5]);
        assert!(get_chunk(&buffer, 3, 10).is_empty());
        assert_eq!(chunk_len(25, 3, 10), 0);
    }

    #[test]
    fn test_chunk_bytes_share_buffer() {
        let buffer = Bytes::from((0..25u8).collect::<Vec<u8>>());
        let chunk = get_chunk_bytes(&buffer, 1, 10);
        assert_eq!(&chunk[..], &buffer[10..20]);
        assert_eq!(chunk.as_ptr(), buffer[10..].as_ptr());
        assert_eq!(get_chunk_bytes(&buffer, 2, 10).len(), 5);
        assert!(get_chunk_bytes(&buffer, 3, 10).is_empty());
    }
}
