// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>

#[macro_export]
#[doc(hidden)]
macro_rules! S
{
    ($expr:expr) => {
        String::from($expr)
    };
}

pub mod baseband;
pub mod cache;
pub mod device;
pub mod error;
pub mod image3;
pub mod ipsw;
pub mod manifest;
pub mod personalizer;
pub mod rerestore;
pub mod ticket;
pub mod usb;
pub mod version_catalogue;

/// Options that select how dangerous/unusual restore behaviour is allowed to be invoked, mirrored
/// from how the reference tool gates re-restore and custom-image paths behind explicit flags
/// rather than silent auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerestoreMode
{
    /// Ordinary restore: fetch a live ticket, use the manifest's default ("Erase") identity.
    Normal,
    /// Re-use a cached/expired ticket; run the re-restore classifier to pick the identity.
    Rerestore,
}

/// Top level session options threaded through the restore pipeline, replacing the reference
/// implementation's global mutable flags (`idevicerestore_debug`, `idevicerestore_keep_pers`)
/// with fields on an explicit context value.
#[derive(Debug, Clone)]
pub struct SessionOptions
{
    pub rerestore: RerestoreMode,
    pub keep_pers: bool,
    pub tss_save_only: bool,
    pub cache_dir: std::path::PathBuf,
}
