// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! SHA-256 with a serializable intermediate state. Neither ring nor sha2
//! expose their hasher state, so the block function from sha2 is driven
//! directly.

use sha2::{
    compress256,
    digest::{consts::U64, generic_array::GenericArray},
};
use thiserror::Error;

const BLOCK_SIZE: usize = 64;

const INITIAL_STATE: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Serialized size of the state words plus the length.
const CONTEXT_HEADER_SIZE: usize = 8 * 4 + 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid hash context size: {0}")]
    InvalidContextSize(usize),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct HashCalculator {
    state: [u32; 8],
    length: u64,
    buffer: [u8; BLOCK_SIZE],
    buffer_len: usize,
}

impl Default for HashCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for HashCalculator {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
            && self.length == other.length
            && self.buffer[..self.buffer_len] == other.buffer[..other.buffer_len]
    }
}

impl Eq for HashCalculator {}

impl std::fmt::Debug for HashCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashCalculator")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl HashCalculator {
    pub fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            length: 0,
            buffer: [0u8; BLOCK_SIZE],
            buffer_len: 0,
        }
    }

    fn compress(state: &mut [u32; 8], block: &[u8]) {
        compress256(
            state,
            std::slice::from_ref(GenericArray::<u8, U64>::from_slice(block)),
        );
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.length = self.length.wrapping_add(data.len() as u64);

        if self.buffer_len > 0 {
            let n = (BLOCK_SIZE - self.buffer_len).min(data.len());
            self.buffer[self.buffer_len..self.buffer_len + n].copy_from_slice(&data[..n]);
            self.buffer_len += n;
            data = &data[n..];

            if self.buffer_len < BLOCK_SIZE {
                return;
            }

            Self::compress(&mut self.state, &self.buffer);
            self.buffer_len = 0;
        }

        let mut chunks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut chunks {
            Self::compress(&mut self.state, block);
        }

        let remainder = chunks.remainder();
        self.buffer[..remainder.len()].copy_from_slice(remainder);
        self.buffer_len = remainder.len();
    }

    /// Total number of bytes hashed so far.
    pub fn bytes_processed(&self) -> u64 {
        self.length
    }

    /// Compute the digest of everything hashed so far. The hasher remains
    /// usable afterwards.
    pub fn finish(&self) -> [u8; 32] {
        let mut hasher = self.clone();
        let bit_length = self.length.wrapping_mul(8);

        let mut padding = [0u8; BLOCK_SIZE + 8];
        padding[0] = 0x80;
        let padding_len = if self.buffer_len < BLOCK_SIZE - 8 {
            BLOCK_SIZE - 8 - self.buffer_len
        } else {
            2 * BLOCK_SIZE - 8 - self.buffer_len
        };

        hasher.update(&padding[..padding_len]);
        hasher.update(&bit_length.to_be_bytes());
        debug_assert_eq!(hasher.buffer_len, 0);

        let mut digest = [0u8; 32];
        for (chunk, word) in digest.chunks_exact_mut(4).zip(hasher.state) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }

        digest
    }

    /// Serialize the intermediate state so hashing can continue in another
    /// process.
    pub fn context(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(CONTEXT_HEADER_SIZE + self.buffer_len);

        for word in self.state {
            result.extend_from_slice(&word.to_be_bytes());
        }
        result.extend_from_slice(&self.length.to_be_bytes());
        result.extend_from_slice(&self.buffer[..self.buffer_len]);

        result
    }

    /// Restore a state previously returned by [`Self::context`].
    pub fn from_context(data: &[u8]) -> Result<Self> {
        if data.len() < CONTEXT_HEADER_SIZE {
            return Err(Error::InvalidContextSize(data.len()));
        }

        let mut state = [0u32; 8];
        for (word, chunk) in state.iter_mut().zip(data[..32].chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let mut length = [0u8; 8];
        length.copy_from_slice(&data[32..CONTEXT_HEADER_SIZE]);
        let length = u64::from_be_bytes(length);

        let buffered = &data[CONTEXT_HEADER_SIZE..];
        if buffered.len() as u64 != length % BLOCK_SIZE as u64 {
            return Err(Error::InvalidContextSize(data.len()));
        }

        let mut buffer = [0u8; BLOCK_SIZE];
        buffer[..buffered.len()].copy_from_slice(buffered);

        Ok(Self {
            state,
            length,
            buffer,
            buffer_len: buffered.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use ring::digest::{SHA256, digest};

    use super::*;

    fn test_data() -> Vec<u8> {
        (0..1000u32).map(|i| (i * 7 + i / 13) as u8).collect()
    }

    #[test]
    fn matches_ring() {
        let data = test_data();

        for size in [0, 1, 55, 56, 63, 64, 65, 119, 120, 128, 1000] {
            let mut hasher = HashCalculator::new();
            hasher.update(&data[..size]);

            assert_eq!(
                hasher.finish().as_slice(),
                digest(&SHA256, &data[..size]).as_ref(),
                "size {size}",
            );
        }
    }

    #[test]
    fn chunked_updates() {
        let data = test_data();
        let mut hasher = HashCalculator::new();

        for chunk in data.chunks(37) {
            hasher.update(chunk);
        }

        assert_eq!(hasher.bytes_processed(), 1000);
        assert_eq!(hasher.finish().as_slice(), digest(&SHA256, &data).as_ref());
    }

    #[test]
    fn context_round_trip() {
        let data = test_data();

        let mut hasher = HashCalculator::new();
        hasher.update(&data[..333]);

        let context = hasher.context();
        assert_eq!(context.len(), CONTEXT_HEADER_SIZE + 333 % 64);

        let mut restored = HashCalculator::from_context(&context).unwrap();
        assert_eq!(restored, hasher);

        restored.update(&data[333..]);
        assert_eq!(restored.finish().as_slice(), digest(&SHA256, &data).as_ref());
    }

    #[test]
    fn invalid_context() {
        assert!(HashCalculator::from_context(&[0u8; 10]).is_err());

        let mut context = HashCalculator::new().context();
        context.push(0);
        assert!(HashCalculator::from_context(&context).is_err());
    }
}
