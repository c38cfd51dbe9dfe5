//! CBC + XOR cipher, host-side and emitted-code implementations
//! (spec component C5).
//!
//! Grounded on `include/poly/encryption.hpp` / `src/` of the original:
//! `Block<N>`, `EncryptionSecret<N>`, and a CBC wrapper generic over a
//! block algorithm. Only XOR is implemented, matching spec.md §4.2 ("Only
//! XOR... is implemented; a no-op algorithm also exists").
//!
//! Per spec.md §9 Open Question 1, this crate adopts the "encrypt the
//! aligned prefix, pass the tail through verbatim" variant: a misaligned
//! buffer still gets its full-block prefix encrypted/decrypted, the
//! non-multiple tail is copied unchanged, and the call additionally
//! returns [`crate::error::CipherError::NotAligned`] so callers can tell
//! the buffer wasn't fully processed.

pub mod emit;

use crate::error::CipherError;
use crate::rng::Rng;

/// An N-byte value treated as a little-endian unsigned integer for cipher
/// arithmetic. `N` is fixed at build time to the host word size (4 or 8),
/// matching `Block<bytes>` in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<const N: usize>(pub [u8; N]);

impl<const N: usize> Block<N> {
    pub fn zero() -> Self {
        Block([0u8; N])
    }

    pub fn from_le_bytes(bytes: [u8; N]) -> Self {
        Block(bytes)
    }

    pub fn to_le_bytes(self) -> [u8; N] {
        self.0
    }

    fn xor(self, other: Block<N>) -> Block<N> {
        let mut out = [0u8; N];
        for i in 0..N {
            out[i] = self.0[i] ^ other.0[i];
        }
        Block(out)
    }
}

/// `EncryptionSecret<N>` in the original: an IV and a key, each N bytes.
#[derive(Debug, Clone, Copy)]
pub struct Secret<const N: usize> {
    pub iv: Block<N>,
    pub key: Block<N>,
}

impl<const N: usize> Secret<N> {
    /// Draws a fresh IV and key from `rng`. Matches spec.md §5's ordering
    /// guarantee: "All random draws happen in a well-defined textual
    /// order: secret.iv, secret.key, then..." — callers must construct
    /// the secret before any other draw in an engine run.
    pub fn generate(rng: &mut Rng) -> Self {
        let mut iv = [0u8; N];
        let mut key = [0u8; N];
        for b in iv.iter_mut() {
            *b = rng.random::<u8>();
        }
        for b in key.iter_mut() {
            *b = rng.random::<u8>();
        }
        Secret { iv: Block(iv), key: Block(key) }
    }
}

/// `EncryptionAlgorithm<kXor>` in the original: `E(secret, block) = block ^ key`.
/// Self-inverse, so the same function serves both directions.
fn xor_block<const N: usize>(key: Block<N>, block: Block<N>) -> Block<N> {
    block.xor(key)
}

/// CBC cipher over the XOR block algorithm (`Cipher<CBC, Xor>` in the
/// original). `N` is the block size in bytes.
pub struct Cipher<const N: usize>;

impl<const N: usize> Cipher<N> {
    /// Encrypts `src` into `dst` (same length) in CBC mode.
    ///
    /// `state` starts as `secret.iv`; for each full block:
    /// `block = read_le(src) ^ state; block = E(secret, block); state = block; write_le(dst, block)`.
    ///
    /// If `len` isn't a multiple of `N`, the trailing bytes are copied
    /// verbatim and `Err(NotAligned)` is returned — the aligned prefix is
    /// still fully encrypted into `dst` (spec.md §4.2, §9 Open Question 1).
    pub fn encrypt(src: &[u8], dst: &mut [u8], secret: &Secret<N>) -> Result<(), CipherError> {
        assert_eq!(src.len(), dst.len(), "src/dst length mismatch");
        let len = src.len();
        let mut state = secret.iv;
        let full_blocks = len / N;
        for i in 0..full_blocks {
            let off = i * N;
            let mut buf = [0u8; N];
            buf.copy_from_slice(&src[off..off + N]);
            let mut block = Block(buf).xor(state);
            block = xor_block(secret.key, block);
            state = block;
            dst[off..off + N].copy_from_slice(&block.to_le_bytes());
        }
        let tail_off = full_blocks * N;
        if tail_off < len {
            dst[tail_off..].copy_from_slice(&src[tail_off..]);
            return Err(CipherError::NotAligned { len, block_size: N });
        }
        Ok(())
    }

    /// Host-side CBC decryption, the inverse of [`Cipher::encrypt`]. Used
    /// by tests to validate round-trips against the emitted decryption
    /// routine ([`emit::assemble_decryption`]) without running JIT code.
    pub fn decrypt(src: &[u8], dst: &mut [u8], secret: &Secret<N>) -> Result<(), CipherError> {
        assert_eq!(src.len(), dst.len(), "src/dst length mismatch");
        let len = src.len();
        let mut state = secret.iv;
        let full_blocks = len / N;
        for i in 0..full_blocks {
            let off = i * N;
            let mut buf = [0u8; N];
            buf.copy_from_slice(&src[off..off + N]);
            let ciphertext = Block(buf);
            let plain = xor_block(secret.key, ciphertext).xor(state);
            state = ciphertext;
            dst[off..off + N].copy_from_slice(&plain.to_le_bytes());
        }
        let tail_off = full_blocks * N;
        if tail_off < len {
            dst[tail_off..].copy_from_slice(&src[tail_off..]);
            return Err(CipherError::NotAligned { len, block_size: N });
        }
        Ok(())
    }
}
