//! A chunk is one capture period's worth of interleaved PCM plus a
//! sampling-rate tag. Buffers are allocated once (at ring construction) and
//! refilled in place, so no heap traffic happens on the capture path.

/// Sampling rate value reserved to mean end-of-stream.
pub const END_OF_STREAM_RATE: u32 = 0;

pub struct Chunk {
    buffer: Vec<u8>,
    size: usize,
    sampling_rate: u32,
}

impl Chunk {
    /// Create a chunk with a fixed byte capacity. The capacity never changes
    /// after construction; only the filled length does.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            size: 0,
            sampling_rate: END_OF_STREAM_RATE,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// The filled part of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.size]
    }

    /// The whole buffer, for in-place refills. Callers set the filled length
    /// with [`set_size`](Self::set_size) afterwards.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Set the filled length, clamped to the fixed capacity.
    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(self.buffer.len());
    }

    pub fn clear(&mut self) {
        self.size = 0;
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    pub fn set_sampling_rate(&mut self, rate: u32) {
        self.sampling_rate = rate;
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.sampling_rate == END_OF_STREAM_RATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_fixed() {
        let mut chunk = Chunk::with_capacity(16);
        assert_eq!(chunk.capacity(), 16);
        chunk.set_size(32);
        assert_eq!(chunk.size(), 16);
        assert_eq!(chunk.capacity(), 16);
    }

    #[test]
    fn test_bytes_tracks_size() {
        let mut chunk = Chunk::with_capacity(8);
        chunk.bytes_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        chunk.set_size(4);
        assert_eq!(chunk.bytes(), &[1, 2, 3, 4]);
        chunk.clear();
        assert!(chunk.bytes().is_empty());
    }

    #[test]
    fn test_end_of_stream_tag() {
        let mut chunk = Chunk::with_capacity(8);
        assert!(chunk.is_end_of_stream());
        chunk.set_sampling_rate(44100);
        assert!(!chunk.is_end_of_stream());
    }
}
