//! Content-defined chunking.
//!
//! Rolling checksum in the bup/librsync Adler-32 family over a 64-byte
//! window. Split points depend only on content, so a localized edit moves
//! at most the chunks around it and the rest keep their MACs (and
//! dedupe server-side). Split-point lengths leak structure, which is why
//! chunk plaintexts are padded and the chunk list shuffled before
//! transport.

/// Rolling window size.
pub const WINDOW_SIZE: usize = 64;

/// Character bias mixed into both checksum words.
pub const CHAR_OFFSET: u32 = 31;

/// Minimum chunk size.
pub const MIN_CHUNK: usize = 1 << 14;

/// Maximum chunk size; a split is forced at this length.
pub const MAX_CHUNK: usize = 1 << 16;

/// Split mask. A boundary fires when the low 12 bits of `s2` are all set.
pub const SPLIT_MASK: u32 = (1 << 12) - 1;

// ---------------------------------------------------------------------------
// Rolling checksum
// ---------------------------------------------------------------------------

/// Two-word rolling checksum over the last [`WINDOW_SIZE`] bytes.
pub struct Rollsum {
    s1: u32,
    s2: u32,
    window: [u8; WINDOW_SIZE],
    wofs: usize,
}

impl Default for Rollsum {
    fn default() -> Self {
        Self::new()
    }
}

impl Rollsum {
    pub fn new() -> Self {
        Self {
            s1: WINDOW_SIZE as u32 * CHAR_OFFSET,
            s2: (WINDOW_SIZE * (WINDOW_SIZE - 1)) as u32 * CHAR_OFFSET,
            window: [0u8; WINDOW_SIZE],
            wofs: 0,
        }
    }

    /// Roll one byte into the window.
    #[inline]
    pub fn update(&mut self, byte: u8) {
        let dropped = u32::from(self.window[self.wofs]);
        self.s1 = self.s1.wrapping_add(u32::from(byte)).wrapping_sub(dropped);
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub(WINDOW_SIZE as u32 * (dropped + CHAR_OFFSET));
        self.window[self.wofs] = byte;
        self.wofs = (self.wofs + 1) % WINDOW_SIZE;
    }

    /// Whether the checksum is at a split point for `mask`.
    #[inline]
    pub fn split(&self, mask: u32) -> bool {
        (self.s2 & mask) == mask
    }
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// Split `buf` into content-defined `[start, end)` ranges.
///
/// A chunk closes when it is at least [`MIN_CHUNK`] long and either the
/// checksum fires on [`SPLIT_MASK`] or the chunk hits [`MAX_CHUNK`]. The
/// tail is emitted as-is; an empty buffer yields no chunks.
pub fn chunkify(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut chunks = Vec::new();
    let mut rollsum = Rollsum::new();
    let mut chunk_start = 0usize;
    for (pos, byte) in buf.iter().enumerate() {
        rollsum.update(*byte);
        if pos - chunk_start >= MIN_CHUNK
            && (pos - chunk_start >= MAX_CHUNK || rollsum.split(SPLIT_MASK))
        {
            chunks.push((chunk_start, pos));
            chunk_start = pos;
        }
    }
    if chunk_start < buf.len() {
        chunks.push((chunk_start, buf.len()));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random bytes (xorshift), for reproducible
    /// boundaries without a rng dev-dependency.
    fn prng_buf(len: usize, mut state: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            out.push((state & 0xff) as u8);
        }
        out
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunkify(&[]).is_empty());
    }

    #[test]
    fn small_input_is_one_chunk() {
        let buf = prng_buf(1000, 1);
        assert_eq!(chunkify(&buf), vec![(0, 1000)]);
    }

    #[test]
    fn chunks_cover_input_contiguously() {
        let buf = prng_buf(300 * 1024, 42);
        let chunks = chunkify(&buf);
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].0, 0);
        assert_eq!(chunks.last().unwrap().1, buf.len());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn chunk_sizes_respect_bounds() {
        let buf = prng_buf(512 * 1024, 7);
        let chunks = chunkify(&buf);
        for (i, (start, end)) in chunks.iter().enumerate() {
            let len = end - start;
            // only the tail may be undersized
            if i + 1 < chunks.len() {
                assert!(len >= MIN_CHUNK, "chunk {i} too small: {len}");
            }
            assert!(len <= MAX_CHUNK, "chunk {i} too large: {len}");
        }
    }

    #[test]
    fn uniform_input_splits_at_max_chunk() {
        // constant bytes never fire the mask, so only the max bound splits
        let buf = vec![0u8; MAX_CHUNK * 2 + 100];
        let chunks = chunkify(&buf);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0], (0, MAX_CHUNK));
    }

    #[test]
    fn split_points_are_deterministic() {
        let buf = prng_buf(200 * 1024, 99);
        assert_eq!(chunkify(&buf), chunkify(&buf));
    }

    fn apply_edits(original: &[u8]) -> Vec<u8> {
        // remove 210 bytes near offset 10000, overwrite 5 bytes at 39000
        let mut edited = original.to_vec();
        edited.drain(10_000..10_210);
        for byte in edited[38_995..39_000].iter_mut() {
            *byte = byte.wrapping_add(1);
        }
        edited
    }

    fn chunk_bytes(buf: &[u8]) -> Vec<Vec<u8>> {
        chunkify(buf)
            .into_iter()
            .map(|(start, end)| buf[start..end].to_vec())
            .collect()
    }

    #[test]
    fn localized_edit_preserves_most_boundaries() {
        let original = prng_buf(120 * 1024, 1234);
        let edited = apply_edits(&original);

        let original_chunks = chunk_bytes(&original);
        let edited_set: std::collections::HashSet<Vec<u8>> =
            chunk_bytes(&edited).into_iter().collect();
        assert!(original_chunks.len() >= 5, "random data must split well below max");

        // both edits land in the first 40 KiB (MIN_CHUNK exceeds the first
        // edit offset, so the leading chunk necessarily contains it); they
        // may disturb only the chunks containing them plus a
        // shifted-boundary neighbor each, and everything later must resync
        let shared = original_chunks
            .iter()
            .filter(|chunk| edited_set.contains(*chunk))
            .count();
        let differing = original_chunks.len() - shared;
        assert!(
            differing <= 4,
            "edits disturbed {differing} of {} chunks",
            original_chunks.len()
        );

        // boundaries must have re-coupled long before the tail
        let tail = original_chunks.last().unwrap();
        assert!(edited_set.contains(tail), "tail chunk did not resync");
    }

    #[test]
    fn distant_chunks_dominate_on_a_large_buffer() {
        let original = prng_buf(512 * 1024, 4321);
        let edited = apply_edits(&original);

        let original_chunks = chunk_bytes(&original);
        let edited_set: std::collections::HashSet<Vec<u8>> =
            chunk_bytes(&edited).into_iter().collect();
        let shared = original_chunks
            .iter()
            .filter(|chunk| edited_set.contains(*chunk))
            .count();

        // with ~25 chunks and both edits confined to the head, at least
        // three quarters must keep their identity
        assert!(original_chunks.len() >= 15);
        assert!(
            shared * 4 >= original_chunks.len() * 3,
            "only {shared} of {} chunks survived the edits",
            original_chunks.len()
        );
    }
}
