// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! Read-only, random-access extraction of named entries out of an IPSW (a ZIP archive of
//! firmware components), with on-disk caching of the one entry that's too large to keep in
//! memory every time: the root filesystem image.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rc_zip_sync::ReadZip;

use crate::cache::{begin_extraction, CachePaths};
use crate::error::{Error, ErrorKind};

/// A read-only handle onto an IPSW's contents. Component paths always come from the build
/// manifest - this reader never guesses a path.
pub struct Ipsw
{
    file: File,
    basename: String,
}

impl Ipsw
{
    pub fn open(path: &Path) -> Result<Self, Error>
    {
        let file = File::open(path)?;
        let basename = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ipsw".to_string());

        Ok(Self { file, basename })
    }

    /// The archive's basename, used as the cache subdirectory name so two different IPSWs never
    /// collide in the filesystem cache.
    pub fn basename(&self) -> &str
    {
        &self.basename
    }

    fn archive(&self) -> Result<rc_zip_sync::ArchiveHandle<'_, File>, Error>
    {
        Ok(self.file.read_zip()?)
    }

    fn entry<'a>(
        archive: &'a rc_zip_sync::ArchiveHandle<'a, File>,
        path: &str,
    ) -> Result<rc_zip_sync::rc_zip::parse::StoredEntry, Error>
    {
        archive
            .by_name(path)
            .cloned()
            .ok_or_else(|| ErrorKind::ArchiveEntry(path.to_string()).error())
    }

    /// Uncompressed size of `path`, used to detect a stale cached filesystem extraction.
    pub fn get_entry_size(&self, path: &str) -> Result<u64, Error>
    {
        let archive = self.archive()?;
        Ok(Self::entry(&archive, path)?.uncompressed_size)
    }

    /// Decompresses `path` entirely into memory.
    pub fn extract_to_memory(&self, path: &str) -> Result<Vec<u8>, Error>
    {
        let archive = self.archive()?;
        let entry = Self::entry(&archive, path)?;
        let mut reader = entry.reader(|offset| {
            let mut file = self.file.try_clone().expect("cloning archive file handle");
            use std::io::Seek;
            file.seek(io::SeekFrom::Start(offset)).expect("seeking archive file handle");
            file
        });

        let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
        reader.read_to_end(&mut out)?;

        Ok(out)
    }

    /// Streams `path` to `dest`, optionally rendering a progress bar - used for the (large) root
    /// filesystem image.
    pub fn extract_to_file(&self, path: &str, dest: &Path, show_progress: bool) -> Result<(), Error>
    {
        let archive = self.archive()?;
        let entry = Self::entry(&archive, path)?;
        let mut reader = entry.reader(|offset| {
            let mut file = self.file.try_clone().expect("cloning archive file handle");
            use std::io::Seek;
            file.seek(io::SeekFrom::Start(offset)).expect("seeking archive file handle");
            file
        });

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(dest)?;
        let progress = show_progress.then(|| {
            let bar = ProgressBar::new(entry.uncompressed_size);
            bar.set_style(
                ProgressStyle::with_template("{msg} [{bar:40}] {bytes}/{total_bytes}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_message(path.to_string());
            bar
        });

        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            out.write_all(&buf[..read])?;
            if let Some(bar) = &progress {
                bar.inc(read as u64);
            }
        }

        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        Ok(())
    }

    /// Extracts `entry_name` into the filesystem cache, reusing a previous extraction if present
    /// and still the right size. Coordinates concurrent callers via [crate::cache::begin_extraction].
    pub fn extract_cached(&self, paths: &CachePaths, entry_name: &str, show_progress: bool) -> Result<PathBuf, Error>
    {
        let canonical_path = paths.extracted_entry(&self.basename, entry_name);
        let expected_size = self.get_entry_size(entry_name)?;

        if let Ok(metadata) = fs::metadata(&canonical_path) {
            if metadata.len() == expected_size {
                debug!("reusing cached extraction of {entry_name} at {}", canonical_path.display());
                return Ok(canonical_path);
            }
            info!("cached {entry_name} is stale (size mismatch); re-extracting");
        }

        let slot = begin_extraction(&canonical_path)?;
        let target = slot.extract_target();
        self.extract_to_file(entry_name, &target, show_progress)?;
        Ok(slot.finish()?)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn open_missing_archive_is_an_io_error()
    {
        let result = Ipsw::open(Path::new("/nonexistent/archive.ipsw"));
        assert!(result.is_err());
    }
}
