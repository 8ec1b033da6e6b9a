// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! Decides whether a re-restore session can reuse the baseband firmware already sitting in the
//! user's archive, or must fetch a freshly signed one from the latest published firmware.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info, warn};
use plist::Dictionary;
use reqwest::blocking::Client;

use crate::error::{Error, ErrorKind};
use crate::ipsw::Ipsw;
use crate::manifest::{BuildManifest, RestoreBehavior};
use crate::version_catalogue::VersionCatalogue;

const BASEBAND_COMPONENT: &str = "BasebandFirmware";

/// `(product type, base index, whether an Update identity adds one more)`. Origin undocumented;
/// treated as fixed, source-derived data rather than tunable configuration.
const REFERENCE_INDEX_TABLE: &[(&str, usize, bool)] = &[
    ("iPhone5,2", 0, true),
    ("iPad3,5", 0, true),
    ("iPhone5,4", 2, true),
    ("iPad3,6", 2, true),
    ("iPhone5,1", 4, true),
    ("iPad3,4", 4, true),
    ("iPhone5,3", 6, true),
];

/// Looks up the reference `BuildIdentities` index for `product_type`/`behavior`. Devices outside
/// the table default to index 0, except on a `build_major >= 14` reference manifest, where the
/// table is mandatory - a fresh signed baseband is a security-relevant artifact and guessing an
/// index on an unfamiliar manifest generation is worse than failing.
fn reference_index(product_type: &str, behavior: RestoreBehavior, reference_build_major: u32) -> Result<usize, Error>
{
    match REFERENCE_INDEX_TABLE.iter().find(|(product, ..)| *product == product_type) {
        Some((_, base, bumps_on_update)) => {
            Ok(base + if *bumps_on_update && behavior == RestoreBehavior::Update { 1 } else { 0 })
        },
        None if reference_build_major >= 14 => Err(ErrorKind::ManifestShape(format!(
            "no reference baseband index for {product_type:?} on a build_major {reference_build_major} manifest"
        ))
        .error()),
        None => Ok(0),
    }
}

/// Outcome of comparing the archive's baseband metadata against the freshly downloaded reference.
#[derive(Debug, PartialEq, Eq)]
pub enum BasebandMatch
{
    Match,
    MismatchAt(String),
}

/// Compares every key of `local` (except `Info`, which is metadata) against `reference`. Type
/// mismatches, value mismatches, and keys missing from the reference are all a
/// [BasebandMatch::MismatchAt].
fn compare_baseband(local: &Dictionary, reference: &Dictionary) -> BasebandMatch
{
    for (key, local_value) in local {
        if key == "Info" {
            continue;
        }

        let Some(reference_value) = reference.get(key) else {
            return BasebandMatch::MismatchAt(key.clone());
        };

        let matches = match (local_value, reference_value) {
            (plist::Value::Data(a), plist::Value::Data(b)) => a == b,
            (plist::Value::Integer(a), plist::Value::Integer(b)) => a == b,
            (plist::Value::String(a), plist::Value::String(b)) => a == b,
            (plist::Value::Boolean(a), plist::Value::Boolean(b)) => a == b,
            (plist::Value::Dictionary(_), plist::Value::Dictionary(_)) => true,
            _ => false,
        };

        if !matches {
            return BasebandMatch::MismatchAt(key.clone());
        }
    }

    BasebandMatch::Match
}

/// Where the session's baseband payload ended up.
pub enum BasebandSource
{
    /// The archive's own baseband, extracted to this path.
    Local(PathBuf),
    /// Freshly downloaded from the vendor because the local one no longer matches what's signed.
    Downloaded(PathBuf),
}

impl BasebandSource
{
    pub fn path(&self) -> &std::path::Path
    {
        match self {
            BasebandSource::Local(p) | BasebandSource::Downloaded(p) => p,
        }
    }
}

/// Runs the full baseband-reuse decision: downloads the reference manifest, compares the
/// archive's baseband metadata against it, and either extracts the local copy or downloads a
/// replacement.
pub fn resolve(
    client: &Client,
    catalogue: &VersionCatalogue,
    ipsw: &Ipsw,
    local_manifest: &BuildManifest,
    product_type: &str,
    model: &str,
    behavior: RestoreBehavior,
    work_dir: &std::path::Path,
) -> Result<BasebandSource, Error>
{
    let local_identity = local_manifest.get_identity_by_model_behavior(model, Some(behavior))?;

    let reference_bytes = download_reference_manifest(client, catalogue, product_type)?;
    let reference_manifest = BuildManifest::from_bytes(&reference_bytes)?;
    let reference_build_major = reference_manifest.get_version_info()?.build_major;

    let index = reference_index(product_type, behavior, reference_build_major)?;
    let reference_identity = reference_manifest.get_identity_by_index(index)?;

    let local_baseband = local_identity.component_metadata(BASEBAND_COMPONENT)?;
    let reference_baseband = reference_identity.component_metadata(BASEBAND_COMPONENT)?;

    match compare_baseband(&local_baseband, &reference_baseband) {
        BasebandMatch::Match => {
            info!("archive baseband matches the currently signed one; reusing it");
            let path = local_identity.get_component_path(BASEBAND_COMPONENT)?;
            let bytes = ipsw.extract_to_memory(path)?;
            let dest = work_dir.join("baseband.local.bbfw");
            fs::create_dir_all(work_dir)?;
            fs::write(&dest, &bytes)?;
            Ok(BasebandSource::Local(dest))
        },
        BasebandMatch::MismatchAt(key) => {
            warn!("archive baseband differs from the signed reference at {key}; fetching a fresh copy");
            let dest = download_baseband(client, catalogue, product_type, &reference_identity, work_dir)?;
            Ok(BasebandSource::Downloaded(dest))
        },
    }
}

fn download_reference_manifest(client: &Client, catalogue: &VersionCatalogue, product_type: &str) -> Result<Vec<u8>, Error>
{
    let url = catalogue.latest_build_manifest_url(product_type)?;
    debug!("downloading reference build manifest from {url}");

    let response = client.get(&url).timeout(Duration::from_secs(60)).send()?;
    Ok(response.error_for_status()?.bytes()?.to_vec())
}

/// Downloads the whole latest IPSW and extracts just the baseband component out of it. The
/// reference implementation issues ranged HTTP GETs against the remote ZIP's central directory to
/// avoid this; that's a meaningful amount of extra machinery for a component that's typically a
/// few megabytes, so this fetches the archive outright instead.
fn download_baseband(
    client: &Client,
    catalogue: &VersionCatalogue,
    product_type: &str,
    reference_identity: &crate::manifest::BuildIdentity,
    work_dir: &std::path::Path,
) -> Result<PathBuf, Error>
{
    let ipsw_url = catalogue.latest_ipsw_url(product_type)?;
    info!("downloading latest firmware archive from {ipsw_url} to resolve baseband");

    fs::create_dir_all(work_dir)?;
    let archive_path = work_dir.join("latest.ipsw");
    let mut response = client.get(&ipsw_url).timeout(Duration::from_secs(600)).send()?.error_for_status()?;
    let mut out = fs::File::create(&archive_path)?;
    std::io::copy(&mut response, &mut out)?;

    let archive = Ipsw::open(&archive_path)?;
    let path = reference_identity.get_component_path(BASEBAND_COMPONENT)?;
    let bytes = archive.extract_to_memory(path)?;

    let dest = work_dir.join("baseband.downloaded.bbfw");
    fs::write(&dest, &bytes)?;
    Ok(dest)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn reference_index_applies_update_bump_for_tabled_products()
    {
        assert_eq!(reference_index("iPhone5,2", RestoreBehavior::Erase, 11).unwrap(), 0);
        assert_eq!(reference_index("iPhone5,2", RestoreBehavior::Update, 11).unwrap(), 1);
        assert_eq!(reference_index("iPhone5,3", RestoreBehavior::Update, 11).unwrap(), 7);
    }

    #[test]
    fn reference_index_defaults_to_zero_for_untabled_product_below_build_14()
    {
        assert_eq!(reference_index("iPhone4,1", RestoreBehavior::Erase, 11).unwrap(), 0);
    }

    #[test]
    fn reference_index_requires_table_entry_on_build_14_and_above()
    {
        assert!(reference_index("iPhone4,1", RestoreBehavior::Erase, 14).is_err());
    }

    #[test]
    fn compare_baseband_matches_identical_dicts()
    {
        let mut local = Dictionary::new();
        local.insert("Digest".to_string(), plist::Value::Data(vec![1, 2, 3]));
        local.insert("Info".to_string(), plist::Value::Dictionary(Dictionary::new()));
        let reference = local.clone();

        assert_eq!(compare_baseband(&local, &reference), BasebandMatch::Match);
    }

    #[test]
    fn compare_baseband_flags_value_mismatch()
    {
        let mut local = Dictionary::new();
        local.insert("Digest".to_string(), plist::Value::Data(vec![1, 2, 3]));
        let mut reference = Dictionary::new();
        reference.insert("Digest".to_string(), plist::Value::Data(vec![9, 9, 9]));

        assert_eq!(compare_baseband(&local, &reference), BasebandMatch::MismatchAt("Digest".to_string()));
    }

    #[test]
    fn compare_baseband_flags_missing_reference_key()
    {
        let mut local = Dictionary::new();
        local.insert("Digest".to_string(), plist::Value::Data(vec![1, 2, 3]));
        let reference = Dictionary::new();

        assert_eq!(compare_baseband(&local, &reference), BasebandMatch::MismatchAt("Digest".to_string()));
    }
}
