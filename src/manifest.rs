// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! Build manifest parsing and build-identity selection.
//!
//! The manifest is a property-list tree; rather than hand-rolling a `{Dict, Array, String, Data,
//! Integer, Bool}` sum type the way the reference implementation's tree-walk helpers do, this
//! module leans on `plist::Value`, which already is that tagged union, and adds the typed
//! accessors the reference's pervasive "check kind, then extract" boilerplate was crying out for.

use std::io::Cursor;

use log::debug;
use plist::Dictionary;

use crate::error::{Error, ErrorKind};

/// Convenience accessors over a manifest subtree, reporting [ErrorKind::ManifestShape] with the
/// offending key path rather than panicking or silently defaulting.
trait DictExt
{
    fn require(&self, key: &str) -> Result<&plist::Value, Error>;
    fn require_dict(&self, key: &str) -> Result<&Dictionary, Error>;
    fn require_str(&self, key: &str) -> Result<&str, Error>;
    fn require_array(&self, key: &str) -> Result<&Vec<plist::Value>, Error>;
}

impl DictExt for Dictionary
{
    fn require(&self, key: &str) -> Result<&plist::Value, Error>
    {
        self.get(key).ok_or_else(|| ErrorKind::ManifestShape(key.to_string()).error())
    }

    fn require_dict(&self, key: &str) -> Result<&Dictionary, Error>
    {
        self.require(key)?
            .as_dictionary()
            .ok_or_else(|| ErrorKind::ManifestShape(format!("{key} (expected dictionary)")).error())
    }

    fn require_str(&self, key: &str) -> Result<&str, Error>
    {
        self.require(key)?
            .as_string()
            .ok_or_else(|| ErrorKind::ManifestShape(format!("{key} (expected string)")).error())
    }

    fn require_array(&self, key: &str) -> Result<&Vec<plist::Value>, Error>
    {
        self.require(key)?
            .as_array()
            .ok_or_else(|| ErrorKind::ManifestShape(format!("{key} (expected array)")).error())
    }
}

/// The two restore variants a build identity can be. `EQ`/`Ord` are derived so the re-restore
/// classifier can simply compare and swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreBehavior
{
    Erase,
    Update,
}

impl RestoreBehavior
{
    pub fn as_str(self) -> &'static str
    {
        match self {
            RestoreBehavior::Erase => "Erase",
            RestoreBehavior::Update => "Update",
        }
    }

    /// The other variant - used by the re-restore classifier's Erase<->Update swap.
    pub fn opposite(self) -> Self
    {
        match self {
            RestoreBehavior::Erase => RestoreBehavior::Update,
            RestoreBehavior::Update => RestoreBehavior::Erase,
        }
    }
}

impl TryFrom<&str> for RestoreBehavior
{
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error>
    {
        if value.eq_ignore_ascii_case("erase") {
            Ok(RestoreBehavior::Erase)
        } else if value.eq_ignore_ascii_case("update") {
            Ok(RestoreBehavior::Update)
        } else {
            Err(ErrorKind::ManifestShape(format!("Info.RestoreBehavior (unknown value {value:?})")).error())
        }
    }
}

/// `ProductVersion` / `ProductBuildVersion` extracted from the manifest root.
#[derive(Debug, Clone)]
pub struct VersionInfo
{
    pub product_version: String,
    pub build_version: String,
    pub build_major: u32,
}

/// One row of `BuildIdentities`: all components for a particular (device class, restore
/// behavior) pair. Detached (cloned) from the parent manifest on return, so callers can hold it
/// independently of the manifest's lifetime.
#[derive(Debug, Clone)]
pub struct BuildIdentity
{
    dict: Dictionary,
}

impl BuildIdentity
{
    fn info(&self) -> Result<&Dictionary, Error>
    {
        self.dict.require_dict("Info")
    }

    pub fn device_class(&self) -> Result<&str, Error>
    {
        self.info()?.require_str("DeviceClass")
    }

    pub fn restore_behavior(&self) -> Result<RestoreBehavior, Error>
    {
        self.info()?.require_str("RestoreBehavior")?.try_into()
    }

    pub fn variant(&self) -> Option<&str>
    {
        self.info().ok()?.get("Variant")?.as_string()
    }

    fn manifest_component(&self, component: &str) -> Result<&Dictionary, Error>
    {
        self.dict.require_dict("Manifest")?.require_dict(component)
    }

    /// `identity.Manifest[component].Info.Path`
    pub fn get_component_path(&self, component: &str) -> Result<&str, Error>
    {
        self.manifest_component(component)?.require_dict("Info")?.require_str("Path")
    }

    /// The full per-component metadata dictionary, copied verbatim into TSS requests by the
    /// ticket client - the manifest resolver does not interpret it.
    pub fn component_metadata(&self, component: &str) -> Result<Dictionary, Error>
    {
        Ok(self.manifest_component(component)?.clone())
    }

    /// All component names present in this identity's `Manifest` dict, for building the full
    /// set of img3 tags in a TSS request.
    pub fn component_names(&self) -> Result<Vec<String>, Error>
    {
        Ok(self.dict.require_dict("Manifest")?.keys().cloned().collect())
    }
}

/// The top-level build manifest: `ProductVersion`, `ProductBuildVersion`, `SupportedProductTypes`,
/// and the ordered `BuildIdentities` table.
#[derive(Debug, Clone)]
pub struct BuildManifest
{
    root: Dictionary,
}

impl BuildManifest
{
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error>
    {
        let value = plist::Value::from_reader(Cursor::new(bytes))?;
        let root = value
            .into_dictionary()
            .ok_or_else(|| ErrorKind::ManifestShape("<root> (expected dictionary)".to_string()).error())?;

        Ok(Self { root })
    }

    /// Succeeds iff `product_type` appears in `SupportedProductTypes`. The key must be present;
    /// its absence is never treated as "anything is supported".
    pub fn check_compatibility(&self, product_type: &str) -> Result<(), Error>
    {
        let supported = self.root.require_array("SupportedProductTypes")?;
        let matches = supported.iter().any(|v| v.as_string() == Some(product_type));

        if matches {
            Ok(())
        } else {
            Err(ErrorKind::ManifestShape(format!("SupportedProductTypes (does not list {product_type:?})")).error())
        }
    }

    pub fn get_version_info(&self) -> Result<VersionInfo, Error>
    {
        let product_version = self.root.require_str("ProductVersion")?.to_string();
        let build_version = self.root.require_str("ProductBuildVersion")?.to_string();
        let build_major = build_version
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .map_err(|_| ErrorKind::ManifestShape("ProductBuildVersion (no leading digits)".to_string()).error())?;

        Ok(VersionInfo { product_version, build_version, build_major })
    }

    fn build_identities(&self) -> Result<&Vec<plist::Value>, Error>
    {
        self.root.require_array("BuildIdentities")
    }

    /// Scans `BuildIdentities`, returning the first entry whose `Info.DeviceClass`
    /// case-insensitively matches `model` and, if `behavior` is given, whose
    /// `Info.RestoreBehavior` case-insensitively matches it too.
    pub fn get_identity_by_model_behavior(
        &self,
        model: &str,
        behavior: Option<RestoreBehavior>,
    ) -> Result<BuildIdentity, Error>
    {
        for entry in self.build_identities()? {
            let Some(dict) = entry.as_dictionary() else { continue };
            let Some(info) = dict.get("Info").and_then(|v| v.as_dictionary()) else { continue };
            let Some(device_class) = info.get("DeviceClass").and_then(|v| v.as_string()) else { continue };

            if !device_class.eq_ignore_ascii_case(model) {
                continue;
            }

            if let Some(wanted) = behavior {
                let Some(actual) = info.get("RestoreBehavior").and_then(|v| v.as_string()) else { continue };
                if !actual.eq_ignore_ascii_case(wanted.as_str()) {
                    continue;
                }
            }

            debug!("matched build identity for model {model} behavior {behavior:?}");
            return Ok(BuildIdentity { dict: dict.clone() });
        }

        Err(ErrorKind::ManifestShape(format!(
            "BuildIdentities (no entry for model {model:?}, behavior {behavior:?})"
        ))
        .error())
    }

    /// Indexed access into `BuildIdentities`, used by the baseband resolver's device-specific
    /// reference-index table.
    pub fn get_identity_by_index(&self, index: usize) -> Result<BuildIdentity, Error>
    {
        let entry = self
            .build_identities()?
            .get(index)
            .ok_or_else(|| ErrorKind::ManifestShape(format!("BuildIdentities[{index}]")).error())?;

        let dict = entry
            .as_dictionary()
            .ok_or_else(|| ErrorKind::ManifestShape(format!("BuildIdentities[{index}] (expected dictionary)")).error())?;

        Ok(BuildIdentity { dict: dict.clone() })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn sample_manifest() -> Vec<u8>
    {
        br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>ProductVersion</key>
    <string>9.3.5</string>
    <key>ProductBuildVersion</key>
    <string>13G36</string>
    <key>SupportedProductTypes</key>
    <array>
        <string>iPhone5,2</string>
    </array>
    <key>BuildIdentities</key>
    <array>
        <dict>
            <key>Info</key>
            <dict>
                <key>DeviceClass</key>
                <string>n56ap</string>
                <key>RestoreBehavior</key>
                <string>Erase</string>
            </dict>
            <key>Manifest</key>
            <dict>
                <key>RestoreRamDisk</key>
                <dict>
                    <key>Info</key>
                    <dict>
                        <key>Path</key>
                        <string>018-1234-001.dmg</string>
                    </dict>
                </dict>
            </dict>
        </dict>
        <dict>
            <key>Info</key>
            <dict>
                <key>DeviceClass</key>
                <string>n56ap</string>
                <key>RestoreBehavior</key>
                <string>Update</string>
            </dict>
            <key>Manifest</key>
            <dict>
                <key>RestoreRamDisk</key>
                <dict>
                    <key>Info</key>
                    <dict>
                        <key>Path</key>
                        <string>018-5678-001.dmg</string>
                    </dict>
                </dict>
            </dict>
        </dict>
    </array>
</dict>
</plist>"#
            .to_vec()
    }

    #[test]
    fn compatibility_check_matches_listed_product()
    {
        let manifest = BuildManifest::from_bytes(&sample_manifest()).unwrap();
        assert!(manifest.check_compatibility("iPhone5,2").is_ok());
        assert!(manifest.check_compatibility("iPhone5,3").is_err());
    }

    #[test]
    fn version_info_extracts_build_major()
    {
        let manifest = BuildManifest::from_bytes(&sample_manifest()).unwrap();
        let info = manifest.get_version_info().unwrap();
        assert_eq!(info.product_version, "9.3.5");
        assert_eq!(info.build_major, 13);
    }

    #[test]
    fn identity_lookup_by_model_and_behavior()
    {
        let manifest = BuildManifest::from_bytes(&sample_manifest()).unwrap();

        let erase = manifest.get_identity_by_model_behavior("n56ap", Some(RestoreBehavior::Erase)).unwrap();
        assert_eq!(erase.get_component_path("RestoreRamDisk").unwrap(), "018-1234-001.dmg");

        let update = manifest.get_identity_by_model_behavior("N56AP", Some(RestoreBehavior::Update)).unwrap();
        assert_eq!(update.get_component_path("RestoreRamDisk").unwrap(), "018-5678-001.dmg");

        assert!(manifest.get_identity_by_model_behavior("n61ap", None).is_err());
    }

    #[test]
    fn identity_lookup_by_index()
    {
        let manifest = BuildManifest::from_bytes(&sample_manifest()).unwrap();
        let identity = manifest.get_identity_by_index(1).unwrap();
        assert_eq!(identity.restore_behavior().unwrap(), RestoreBehavior::Update);
        assert!(manifest.get_identity_by_index(5).is_err());
    }

    #[test]
    fn missing_required_key_is_manifest_shape_error()
    {
        let identity = BuildManifest::from_bytes(&sample_manifest())
            .unwrap()
            .get_identity_by_index(0)
            .unwrap();

        match identity.get_component_path("KernelCache") {
            Err(e) => assert!(matches!(e.kind, ErrorKind::ManifestShape(_))),
            Ok(_) => panic!("expected a ManifestShape error"),
        }
    }
}
