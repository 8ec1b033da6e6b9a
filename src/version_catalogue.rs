// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! The global `version.xml` catalogue: fetched over HTTP, cached for 24 hours, and consulted for
//! WTF stage-0 loader URL discovery and latest-firmware lookups when a locally cached baseband
//! needs checking against what's currently signed.

use std::fs;
use std::io::Cursor;
use std::time::Duration;

use log::{info, warn};
use plist::Dictionary;
use reqwest::blocking::Client;

use crate::cache::{is_stale, CachePaths, VERSION_CATALOGUE_MAX_AGE};
use crate::error::{Error, ErrorKind};

const VERSION_CATALOGUE_URL: &str = "http://itunes.apple.com/check/version";

/// A decade-old, possibly-defunct fallback used only when neither the archive nor the catalogue
/// has a WTF loader for the device - kept as a last resort, matching the reference behaviour, but
/// surfaced as an error rather than retried if it too fails.
const HARDCODED_WTF_URL: &str =
    "http://appldnld.apple.com.edgesuite.net/content.info.apple.com/iPhone/061-6618.20090617.Xse7Y/x12220000_5_Recovery.ipsw";

pub struct VersionCatalogue
{
    root: Dictionary,
}

impl VersionCatalogue
{
    /// Loads the catalogue from `<cache_dir>/version.xml`, refreshing it first if it's missing or
    /// older than [VERSION_CATALOGUE_MAX_AGE]. A failed refresh is non-fatal: the previous copy
    /// (if any) is reused and a [ErrorKind::VersionCatalogueDown] is only returned when there is
    /// no copy to fall back on.
    pub fn fetch_or_cached(paths: &CachePaths, client: &Client) -> Result<Self, Error>
    {
        let path = paths.version_catalogue();

        if is_stale(&path, VERSION_CATALOGUE_MAX_AGE) {
            match Self::refresh(client) {
                Ok(bytes) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, &bytes)?;
                    info!("refreshed version catalogue");
                },
                Err(e) => {
                    if path.exists() {
                        warn!("failed to refresh version catalogue, reusing cached copy: {e}");
                    } else {
                        return Err(ErrorKind::VersionCatalogueDown.error_from(Box::new(e) as _));
                    }
                },
            }
        }

        let bytes = fs::read(&path)?;
        Self::parse(&bytes)
    }

    fn refresh(client: &Client) -> Result<Vec<u8>, Error>
    {
        let response = client.get(VERSION_CATALOGUE_URL).timeout(Duration::from_secs(30)).send()?;
        Ok(response.error_for_status()?.bytes()?.to_vec())
    }

    fn parse(bytes: &[u8]) -> Result<Self, Error>
    {
        let value = plist::Value::from_reader(Cursor::new(bytes))?;
        let root = value
            .into_dictionary()
            .ok_or_else(|| ErrorKind::ManifestShape("version.xml <root> (expected dictionary)".to_string()).error())?;

        Ok(Self { root })
    }

    /// Looks up the WTF loader URL at `MobileDeviceSoftwareVersionsByVersion.5.
    /// RecoverySoftwareVersions.WTF.304218112.5.FirmwareURL` - a literal path, not parameterized
    /// by the connected device's build or product type, mirroring the reference tool's own
    /// hardcoded lookup (WTF mode only ever applied to the handful of bootrom-bug devices that
    /// shipped under build major 5). Absence at any level is reported rather than guessed at.
    pub fn wtf_url(&self) -> Result<String, Error>
    {
        self.root
            .get("MobileDeviceSoftwareVersionsByVersion")
            .and_then(|v| v.as_dictionary())
            .and_then(|v| v.get("5"))
            .and_then(|v| v.as_dictionary())
            .and_then(|v| v.get("RecoverySoftwareVersions"))
            .and_then(|v| v.as_dictionary())
            .and_then(|v| v.get("WTF"))
            .and_then(|v| v.as_dictionary())
            .and_then(|v| v.get("304218112"))
            .and_then(|v| v.as_dictionary())
            .and_then(|v| v.get("5"))
            .and_then(|v| v.as_dictionary())
            .and_then(|v| v.get("FirmwareURL"))
            .and_then(|v| v.as_string())
            .map(str::to_string)
            .ok_or_else(|| ErrorKind::ArchiveEntry("version.xml has no WTF loader URL".to_string()).error())
    }

    /// The last-resort hardcoded URL, used only once every other option (archive-embedded loader,
    /// catalogue lookup) has failed.
    pub fn hardcoded_wtf_url() -> &'static str
    {
        HARDCODED_WTF_URL
    }

    /// `Latest.BuildManifestURL`, the vendor URL for the most recent firmware's build manifest -
    /// consumed by the baseband resolver to fetch a fresh reference manifest.
    pub fn latest_build_manifest_url(&self, product_type: &str) -> Result<String, Error>
    {
        self.latest_restore_field(product_type, "BuildManifestURL")
    }

    /// `Latest.FirmwareURL`, the vendor URL for the most recent firmware's full IPSW archive -
    /// consumed by the baseband resolver when the local baseband must be replaced.
    pub fn latest_ipsw_url(&self, product_type: &str) -> Result<String, Error>
    {
        self.latest_restore_field(product_type, "FirmwareURL")
    }

    fn latest_restore_field(&self, product_type: &str, field: &str) -> Result<String, Error>
    {
        self.root
            .get("MobileDeviceSoftwareVersionsByVersion")
            .and_then(|v| v.as_dictionary())
            .and_then(|versions| {
                versions.values().find_map(|entry| {
                    entry
                        .as_dictionary()?
                        .get("MobileDeviceSoftwareVersions")?
                        .as_dictionary()?
                        .get(product_type)?
                        .as_dictionary()?
                        .get("Unknown")?
                        .as_dictionary()?
                        .get("Universal")?
                        .as_dictionary()?
                        .get("Restore")?
                        .as_dictionary()?
                        .get(field)?
                        .as_string()
                })
            })
            .map(str::to_string)
            .ok_or_else(|| {
                ErrorKind::ArchiveEntry(format!("version.xml has no latest-firmware {field} for this device")).error()
            })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn sample_catalogue() -> Vec<u8>
    {
        br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>MobileDeviceSoftwareVersionsByVersion</key>
    <dict>
        <key>5</key>
        <dict>
            <key>RecoverySoftwareVersions</key>
            <dict>
                <key>WTF</key>
                <dict>
                    <key>304218112</key>
                    <dict>
                        <key>5</key>
                        <dict>
                            <key>FirmwareURL</key>
                            <string>http://example.invalid/WTF.s5l8950xall.RELEASE.dfu</string>
                        </dict>
                    </dict>
                </dict>
            </dict>
        </dict>
    </dict>
</dict>
</plist>"#
            .to_vec()
    }

    #[test]
    fn wtf_url_is_extracted_from_nested_plist()
    {
        let catalogue = VersionCatalogue::parse(&sample_catalogue()).unwrap();
        assert_eq!(catalogue.wtf_url().unwrap(), "http://example.invalid/WTF.s5l8950xall.RELEASE.dfu");
    }

    #[test]
    fn wtf_url_missing_is_an_error()
    {
        let catalogue = VersionCatalogue::parse(br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict/>
</plist>"#)
        .unwrap();
        assert!(catalogue.wtf_url().is_err());
    }
}
