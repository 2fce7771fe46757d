//! Turns a fetched container payload back into plaintext chunks.
//!
//! Every chunk is AES-256-CTR encrypted under its own key, optionally zstd
//! compressed before encryption, and carries a checksum over its plaintext.

use std::sync::Arc;

use aes::Aes256;
use bytes::Bytes;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

use crate::error::DecryptError;
use crate::model::{ChunkKey, Compression, Container};

const IV_CONTEXT: &str = "chunkhaul 2025-01 chunk iv";

/// Decrypts all chunks of one container.
///
/// Instances are handed out per absorbed container and may keep scratch state
/// between the chunks of that container.
pub trait Decrypter: Send {
    fn decrypt(
        &mut self,
        container: &Container,
        payload: &[u8],
    ) -> Result<Vec<Bytes>, DecryptError>;
}

pub type DecrypterFactory = Arc<dyn Fn() -> Box<dyn Decrypter> + Send + Sync>;

pub fn chunk_decrypters() -> DecrypterFactory {
    Arc::new(|| Box::new(ChunkDecrypter::default()) as Box<dyn Decrypter>)
}

#[derive(Default)]
pub struct ChunkDecrypter {
    decompressor: Option<zstd::bulk::Decompressor<'static>>,
}

impl ChunkDecrypter {
    fn decompress(
        &mut self,
        index: usize,
        data: &[u8],
        size: u32,
    ) -> Result<Vec<u8>, DecryptError> {
        let decompressor = match &mut self.decompressor {
            Some(decompressor) => decompressor,
            empty => empty.insert(
                zstd::bulk::Decompressor::new()
                    .map_err(|source| DecryptError::Decompress { index, source })?,
            ),
        };
        decompressor
            .decompress(data, size as usize)
            .map_err(|source| DecryptError::Decompress { index, source })
    }
}

impl Decrypter for ChunkDecrypter {
    fn decrypt(
        &mut self,
        container: &Container,
        payload: &[u8],
    ) -> Result<Vec<Bytes>, DecryptError> {
        let mut chunks = Vec::with_capacity(container.chunks.len());

        for (index, descriptor) in container.chunks.iter().enumerate() {
            let start = descriptor.offset as u64;
            let end = start + descriptor.encrypted_size as u64;
            if end > payload.len() as u64 {
                return Err(DecryptError::OutOfBounds {
                    index,
                    start,
                    end,
                    payload_len: payload.len(),
                });
            }

            let mut data = payload[start as usize..end as usize].to_vec();
            apply_keystream(&descriptor.key, &mut data);

            let plaintext = match descriptor.compression {
                Compression::None => data,
                Compression::Zstd => self.decompress(index, &data, descriptor.size)?,
            };
            if plaintext.len() != descriptor.size as usize {
                return Err(DecryptError::SizeMismatch {
                    index,
                    expected: descriptor.size,
                    actual: plaintext.len(),
                });
            }
            if !descriptor.checksum.matches(&plaintext) {
                return Err(DecryptError::ChecksumMismatch { index });
            }

            chunks.push(Bytes::from(plaintext));
        }

        Ok(chunks)
    }
}

/// Compresses (if asked to) and encrypts one chunk. The inverse of what
/// [`ChunkDecrypter`] does per chunk.
pub fn seal_chunk(
    key: &ChunkKey,
    plaintext: &[u8],
    compression: Compression,
) -> std::io::Result<Vec<u8>> {
    let mut data = match compression {
        Compression::None => plaintext.to_vec(),
        Compression::Zstd => zstd::bulk::compress(plaintext, 3)?,
    };
    apply_keystream(key, &mut data);
    Ok(data)
}

fn apply_keystream(key: &ChunkKey, data: &mut [u8]) {
    let iv = derive_iv(key);
    let mut cipher = Ctr128BE::<Aes256>::new((&key.0).into(), &iv.into());
    cipher.apply_keystream(data);
}

/// The IV is bound to the key, every chunk has its own key.
fn derive_iv(key: &ChunkKey) -> [u8; 16] {
    let derived = blake3::derive_key(IV_CONTEXT, &key.0);
    let mut iv = [0; 16];
    iv.copy_from_slice(&derived[..16]);
    iv
}
