// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! Parsing and manipulation of the pre-Image4 "Image3" signed-payload container.
//!
//! Layout: a 12-byte header (magic, full size, data size), followed at offset `HEADER_LEN` by
//! the hashed/signed body, whose own first four bytes are a size field covering the rest of the
//! body. A zero value there (byte offset `0x0C` from the start of the image) marks an unsigned,
//! custom-built image rather than a tampering attempt - several jailbreak-era tools produce
//! these deliberately.

use sha1::{Digest, Sha1};

use crate::error::{Error, ErrorKind};

/// Length of the Image3 header, and the offset at which the hashed body begins.
pub const HEADER_LEN: usize = 12;

/// Size of the blob prefix embedded into the signature region during personalization.
pub const STITCH_PREFIX_LEN: usize = 64;

/// A view over a candidate Image3 payload.
pub struct SignedImage<'b>
{
    bytes: &'b [u8],
}

impl<'b> SignedImage<'b>
{
    pub fn new(bytes: &'b [u8]) -> Self
    {
        Self { bytes }
    }

    /// True if the image is too short to contain a header, or its data-size field is zero -
    /// either way this is a custom, unsigned image rather than a live-signed one.
    pub fn is_unsigned(&self) -> bool
    {
        if self.bytes.len() < 0x14 {
            return true;
        }

        self.data_size_field() == 0
    }

    /// The 4-byte size field at offset `0x0C`, i.e. the first four bytes of `body()`.
    fn data_size_field(&self) -> u32
    {
        u32::from_le_bytes(self.bytes[HEADER_LEN..HEADER_LEN + 4].try_into().expect("checked length above"))
    }

    /// The hashed body: everything from `HEADER_LEN` to the end of the payload.
    pub fn body(&self) -> &'b [u8]
    {
        &self.bytes[HEADER_LEN..]
    }

    /// SHA-1 digest of `body()`, as compared against the ticket's `APTicket` bytes by the
    /// re-restore classifier.
    pub fn body_digest(&self) -> [u8; 20]
    {
        let mut hasher = Sha1::new();
        hasher.update(self.body());
        hasher.finalize().into()
    }
}

/// Replaces the signature region of `payload` with the first [STITCH_PREFIX_LEN] bytes of
/// `blob`, producing a personalized copy. `component_name` is used only for error context.
pub fn img3_stitch(component_name: &str, payload: &[u8], blob: &[u8]) -> Result<Vec<u8>, Error>
{
    if payload.len() < 0x14 {
        return Err(ErrorKind::ArchiveEntry(format!("{component_name} payload too short to personalize")).error());
    }

    let image = SignedImage::new(payload);
    let sig_offset = HEADER_LEN + image.data_size_field() as usize;
    let prefix_len = STITCH_PREFIX_LEN.min(blob.len());

    if sig_offset + prefix_len > payload.len() {
        return Err(ErrorKind::ArchiveEntry(format!(
            "{component_name} signature region ({sig_offset}..{}) does not fit within payload of {} bytes",
            sig_offset + prefix_len,
            payload.len(),
        ))
        .error());
    }

    let mut out = payload.to_vec();
    out[sig_offset..sig_offset + prefix_len].copy_from_slice(&blob[..prefix_len]);

    Ok(out)
}
