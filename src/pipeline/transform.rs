use std::io::Write;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use anyhow::{Context, Result};
use flate2::write::{GzEncoder, ZlibEncoder};
use sha1::{Digest, Sha1};

use crate::models::{Compression, EncryptionDetails};

/// The AES-128 key and block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// A byte-to-byte pipeline stage, used for compression and encryption.
pub trait Transformer: Send + Sync {
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Build the compression stage of the given algorithm, if any.
pub fn build_compressor(compression: Compression) -> Option<Box<dyn Transformer>> {
    match compression {
        Compression::None => None,
        Compression::Gzip => Some(Box::new(GzipCompressor)),
        Compression::Zip => Some(Box::new(ZlibCompressor)),
    }
}

/// Gzip compression, yielding base64 text.
pub struct GzipCompressor;

impl Transformer for GzipCompressor {
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).context("error writing data to gzip encoder")?;
        let compressed = encoder.finish().context("error finishing gzip stream")?;
        Ok(base64::encode(compressed).into_bytes())
    }
}

/// Zlib compression, yielding base64 text.
pub struct ZlibCompressor;

impl Transformer for ZlibCompressor {
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).context("error writing data to zlib encoder")?;
        let compressed = encoder.finish().context("error finishing zlib stream")?;
        Ok(base64::encode(compressed).into_bytes())
    }
}

/// AES-128-CBC encryption with PKCS#7 padding, yielding base64 text.
pub struct AesEncryptor {
    key: [u8; AES_BLOCK_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
}

impl AesEncryptor {
    /// Create a new instance from a registration's encryption details.
    ///
    /// The key is the first 16 bytes of the SHA-1 digest of the configured key. The IV is the
    /// configured IV, truncated or zero padded to 16 bytes.
    pub fn new(details: &EncryptionDetails) -> Self {
        let (key, iv) = derive_key_iv(details);
        Self { key, iv }
    }
}

/// Derive the AES key and IV of the given encryption details.
pub fn derive_key_iv(details: &EncryptionDetails) -> ([u8; AES_BLOCK_SIZE], [u8; AES_BLOCK_SIZE]) {
    let digest = Sha1::digest(details.key.as_bytes());
    let mut key = [0u8; AES_BLOCK_SIZE];
    key.copy_from_slice(&digest[..AES_BLOCK_SIZE]);

    let mut iv = [0u8; AES_BLOCK_SIZE];
    let iv_src = details.init_vector.as_bytes();
    let len = iv_src.len().min(AES_BLOCK_SIZE);
    iv[..len].copy_from_slice(&iv_src[..len]);
    (key, iv)
}

impl Transformer for AesEncryptor {
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data);
        Ok(base64::encode(ciphertext).into_bytes())
    }
}
