// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! On-disk cache layout and the lock-file/sentinel coordination used for concurrent extraction
//! of the (large) root filesystem image out of an IPSW.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use directories::ProjectDirs;
use log::{debug, warn};

use crate::error::Error;

/// How long the version catalogue is trusted before a refresh is attempted, per the reference
/// implementation's `time()`-based staleness check.
pub const VERSION_CATALOGUE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolves the default cache directory the way the companion-utility CLI resolves its own
/// application directories, via [directories::ProjectDirs].
pub fn default_cache_dir() -> Result<PathBuf, Error>
{
    let dirs = ProjectDirs::from("org", "black-magic", "fwrestore").ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "could not determine a cache directory for this platform").into()
    })?;

    Ok(dirs.cache_dir().to_path_buf())
}

/// Layout of paths under `<cache_dir>`, matching the persisted-state layout documented for this
/// tool.
pub struct CachePaths
{
    root: PathBuf,
}

impl CachePaths
{
    pub fn new(root: PathBuf) -> Self
    {
        Self { root }
    }

    pub fn root(&self) -> &Path
    {
        &self.root
    }

    pub fn version_catalogue(&self) -> PathBuf
    {
        self.root.join("version.xml")
    }

    pub fn shsh_ticket(&self, ecid: u64, product: &str, version: &str, build: &str) -> PathBuf
    {
        self.root.join("shsh").join(format!("{ecid:016X}-{product}-{version}-{build}.shsh"))
    }

    pub fn extracted_entry(&self, archive_basename: &str, entry_name: &str) -> PathBuf
    {
        self.root.join(archive_basename).join(entry_name)
    }

    pub fn personalized_component(&self, component: &str) -> PathBuf
    {
        self.root.join("personalized").join(component)
    }
}

/// True if `path` doesn't exist, or does but is older than `max_age`. A missing file is always
/// stale so the first run always attempts a refresh.
pub fn is_stale(path: &Path, max_age: Duration) -> bool
{
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return true,
    };

    let modified = match metadata.modified() {
        Ok(modified) => modified,
        Err(_) => return true,
    };

    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > max_age,
        // Clock went backwards; be conservative and treat it as fresh rather than churn refreshes.
        Err(_) => false,
    }
}

/// Outcome of attempting to become the sole extractor of a cached entry.
pub enum ExtractionSlot
{
    /// We hold the lock; extract to `canonical_path`, then call [ExtractionSlot::finish].
    Owner { canonical_path: PathBuf, lock_path: PathBuf },
    /// Someone else is already extracting; use this host-unique temporary path instead, and
    /// delete it once done with it.
    Borrowed { temp_path: PathBuf },
}

/// Attempts to acquire the advisory lock for `canonical_path`, following the
/// `<target>.lock` / `<target>.extract` / rename-on-success convention: the lock file's
/// existence is the advisory signal, and the holder marks its in-progress output with a
/// `.extract` suffix so a reader can never observe a partially written canonical file.
pub fn begin_extraction(canonical_path: &Path) -> io::Result<ExtractionSlot>
{
    let lock_path = lock_path_for(canonical_path);

    match File::options().create_new(true).write(true).open(&lock_path) {
        Ok(_lock_file) => {
            debug!("acquired extraction lock {}", lock_path.display());
            Ok(ExtractionSlot::Owner { canonical_path: canonical_path.to_path_buf(), lock_path })
        },
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!("{} is already being extracted by another process; using a private copy", canonical_path.display());
            let temp_path = canonical_path.with_extension(format!("tmp-{}", std::process::id()));
            Ok(ExtractionSlot::Borrowed { temp_path })
        },
        Err(e) => Err(e),
    }
}

impl ExtractionSlot
{
    /// The path the caller should extract the entry's bytes into.
    pub fn extract_target(&self) -> PathBuf
    {
        match self {
            ExtractionSlot::Owner { canonical_path, .. } => extract_sentinel_path(canonical_path),
            ExtractionSlot::Borrowed { temp_path } => temp_path.clone(),
        }
    }

    /// Call after a successful extraction. For the lock owner this renames the `.extract`
    /// sentinel into place and releases the lock; for a borrowed slot it is a no-op (the caller
    /// is responsible for using and then discarding its private copy).
    pub fn finish(self) -> io::Result<PathBuf>
    {
        match self {
            ExtractionSlot::Owner { canonical_path, lock_path } => {
                fs::rename(extract_sentinel_path(&canonical_path), &canonical_path)?;
                let _ = fs::remove_file(&lock_path);
                Ok(canonical_path)
            },
            ExtractionSlot::Borrowed { temp_path } => Ok(temp_path),
        }
    }
}

fn lock_path_for(canonical_path: &Path) -> PathBuf
{
    let mut lock_path = canonical_path.as_os_str().to_os_string();
    lock_path.push(".lock");
    PathBuf::from(lock_path)
}

/// `<name>.extract` (or `<name>.<ext>.extract` when `canonical_path` already has an extension).
fn extract_sentinel_path(canonical_path: &Path) -> PathBuf
{
    let mut sentinel = canonical_path.as_os_str().to_os_string();
    sentinel.push(".extract");
    PathBuf::from(sentinel)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn is_stale_treats_missing_file_as_stale()
    {
        assert!(is_stale(Path::new("/nonexistent/path/for/test"), VERSION_CATALOGUE_MAX_AGE));
    }

    #[test]
    fn cache_paths_follow_documented_layout()
    {
        let paths = CachePaths::new(PathBuf::from("/cache"));
        assert_eq!(paths.version_catalogue(), PathBuf::from("/cache/version.xml"));
        assert_eq!(
            paths.shsh_ticket(0xDEADBEEF, "iPhone5,2", "9.3.5", "13G36"),
            PathBuf::from("/cache/shsh/00000000DEADBEEF-iPhone5,2-9.3.5-13G36.shsh")
        );
    }

    #[test]
    fn second_extraction_attempt_is_borrowed()
    {
        let dir = std::env::temp_dir().join(format!("fwrestore-cache-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let target = dir.join("restore.dmg");

        let first = begin_extraction(&target).unwrap();
        assert!(matches!(first, ExtractionSlot::Owner { .. }));

        let second = begin_extraction(&target).unwrap();
        assert!(matches!(second, ExtractionSlot::Borrowed { .. }));

        let _ = fs::remove_dir_all(&dir);
    }
}
