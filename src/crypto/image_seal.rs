//! Item Vault - Format-Aware Image Encryption
//!
//! Encrypted image layout:
//! ```text
//! [HEADER  header_length B][left verbatim]
//! [NONCE   12B][random]
//! [CIPHERTEXT variable][AES-256-GCM encrypted body + 16B tag]
//! ```
//!
//! Keeping the container header intact leaves the file recognisable as its
//! format while every pixel byte is sealed. For PNG the first 33 bytes are the
//! signature (8) and the IHDR chunk (length 4, type 4, data 13, CRC 4), which
//! leak size, bit depth, colour type and interlacing. For WebP the first 12
//! bytes are `RIFF`, the file size and `WEBP`, which leak nothing beyond the
//! file length.

use image::ImageFormat;

use super::aead::{aead_decrypt, aead_encrypt, EncryptedData};
use super::keys::DataKey;
use crate::error::{VaultError, VaultResult};

/// Codec and header layout of one image role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormatSpec {
    /// MIME type
    pub mime: &'static str,
    /// File extension, including the dot
    pub extension: &'static str,
    /// Number of leading bytes kept in plaintext
    pub header_length: usize,
    /// Codec used to encode rasters in this role
    pub codec: ImageFormat,
}

/// Thumbnail pools: lossless, so untouched slots survive re-encoding unchanged
pub const THUMBNAIL_FORMAT: ImageFormatSpec = ImageFormatSpec {
    mime: "image/png",
    extension: ".png",
    header_length: 33,
    codec: ImageFormat::Png,
};

/// Full images: one file per item, replaced wholesale on change
pub const IMAGE_FORMAT: ImageFormatSpec = ImageFormatSpec {
    mime: "image/webp",
    extension: ".webp",
    header_length: 12,
    codec: ImageFormat::WebP,
};

impl ImageFormatSpec {
    /// File name for a stem in this format
    pub fn file_name(&self, stem: &str) -> String {
        format!("{}{}", stem, self.extension)
    }
}

/// Encrypt everything after the format header
pub fn encrypt_image(
    image: &[u8],
    format: &ImageFormatSpec,
    key: &DataKey,
) -> VaultResult<Vec<u8>> {
    if image.len() < format.header_length {
        return Err(VaultError::ImageCodec(format!(
            "{} image shorter than its {} byte header",
            format.mime, format.header_length
        )));
    }

    let (header, body) = image.split_at(format.header_length);
    let sealed = aead_encrypt(key, body)?.to_bytes();

    let mut output = Vec::with_capacity(header.len() + sealed.len());
    output.extend_from_slice(header);
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Inverse of [`encrypt_image`]
pub fn decrypt_image(
    encrypted: &[u8],
    format: &ImageFormatSpec,
    key: &DataKey,
) -> VaultResult<Vec<u8>> {
    if encrypted.len() < format.header_length {
        return Err(VaultError::AuthenticationFailure(format!(
            "encrypted {} image is truncated",
            format.mime
        )));
    }

    let (header, rest) = encrypted.split_at(format.header_length);
    let sealed = EncryptedData::from_bytes(rest)?;
    let body = aead_decrypt(key, &sealed.ciphertext, &sealed.nonce)?;

    let mut output = Vec::with_capacity(header.len() + body.len());
    output.extend_from_slice(header);
    output.extend_from_slice(&body);
    Ok(output)
}
