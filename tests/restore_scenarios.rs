// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! End-to-end exercises of the re-restore classifier and the ticket cache against fixture data,
//! built from scratch rather than against a real device or signing service.

use std::fs;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use reqwest::blocking::Client;

use fwrestore::cache::CachePaths;
use fwrestore::image3::SignedImage;
use fwrestore::ipsw::Ipsw;
use fwrestore::manifest::{BuildManifest, RestoreBehavior};
use fwrestore::rerestore::classify;
use fwrestore::ticket::{Ticket, TicketClient, TicketKey};

fn scratch_dir(tag: &str) -> PathBuf
{
    let dir = std::env::temp_dir().join(format!("fwrestore-scenario-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Same header-stamping the Image3 unit tests use: a 12-byte header followed by a body whose
/// first four bytes are the data-size field (`4 + content.len()`), then `content` itself.
fn image_with_body(content: &[u8]) -> Vec<u8>
{
    let data_size = (4 + content.len()) as u32;

    let mut bytes = vec![0u8; 12];
    bytes[0..4].copy_from_slice(b"3gmI");
    bytes[4..8].copy_from_slice(&(12 + data_size).to_le_bytes());
    bytes.extend_from_slice(&data_size.to_le_bytes());
    bytes.extend_from_slice(content);
    bytes
}

fn unsigned_image(content: &[u8]) -> Vec<u8>
{
    let mut bytes = image_with_body(content);
    bytes[12..16].copy_from_slice(&0u32.to_le_bytes());
    bytes
}

fn crc32(data: &[u8]) -> u32
{
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
        }
    }
    !crc
}

/// Writes a minimal stored-method (uncompressed) ZIP archive, just enough structure for
/// `rc-zip-sync` to read back the entries it's given.
fn write_ipsw_fixture(path: &Path, entries: &[(&str, &[u8])])
{
    let mut body = Vec::new();
    let mut central = Vec::new();
    let mut offsets = Vec::with_capacity(entries.len());

    for (name, data) in entries {
        offsets.push(body.len() as u32);
        let crc = crc32(data);

        body.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        body.extend_from_slice(&20u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&crc.to_le_bytes());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(data);
    }

    for (i, (name, data)) in entries.iter().enumerate() {
        let crc = crc32(data);

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u32.to_le_bytes());
        central.extend_from_slice(&offsets[i].to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }

    let cd_offset = body.len() as u32;
    let cd_size = central.len() as u32;
    body.extend_from_slice(&central);
    body.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    body.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    body.extend_from_slice(&cd_size.to_le_bytes());
    body.extend_from_slice(&cd_offset.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());

    fs::write(path, &body).unwrap();
}

/// A manifest with one "Erase" and one "Update" identity for device class `n56ap`, each pointing
/// `RestoreRamDisk` at its own archive entry.
fn two_behavior_manifest() -> Vec<u8>
{
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>ProductVersion</key><string>9.3.5</string>
    <key>ProductBuildVersion</key><string>13G36</string>
    <key>SupportedProductTypes</key><array><string>iPhone5,2</string></array>
    <key>BuildIdentities</key>
    <array>
        <dict>
            <key>Info</key><dict><key>DeviceClass</key><string>n56ap</string><key>RestoreBehavior</key><string>Erase</string></dict>
            <key>Manifest</key><dict><key>RestoreRamDisk</key><dict><key>Info</key><dict><key>Path</key><string>{erase}</string></dict></dict></dict>
        </dict>
        <dict>
            <key>Info</key><dict><key>DeviceClass</key><string>n56ap</string><key>RestoreBehavior</key><string>Update</string></dict>
            <key>Manifest</key><dict><key>RestoreRamDisk</key><dict><key>Info</key><dict><key>Path</key><string>{update}</string></dict></dict></dict>
        </dict>
    </array>
</dict>
</plist>"#,
        erase = "ramdisk-erase.dmg",
        update = "ramdisk-update.dmg",
    )
    .into_bytes()
}

fn ticket_embedding(digest: &[u8; 20]) -> Vec<u8>
{
    let mut ticket = vec![0xFFu8; 200];
    ticket[64..64 + 20].copy_from_slice(digest);
    ticket
}

#[test]
fn rerestore_matches_erase_ramdisk_without_swapping()
{
    let dir = scratch_dir("erase-match");
    let ipsw_path = dir.join("fixture.ipsw");

    let erase_body = b"erase-ramdisk-contents";
    let update_body = b"update-ramdisk-contents";
    let erase_image = image_with_body(erase_body);
    write_ipsw_fixture(
        &ipsw_path,
        &[("ramdisk-erase.dmg", &erase_image), ("ramdisk-update.dmg", &image_with_body(update_body))],
    );

    let manifest = BuildManifest::from_bytes(&two_behavior_manifest()).unwrap();
    let ipsw = Ipsw::open(&ipsw_path).unwrap();
    let erase_identity = manifest.get_identity_by_model_behavior("n56ap", Some(RestoreBehavior::Erase)).unwrap();

    let ap_ticket = ticket_embedding(&SignedImage::new(&erase_image).body_digest());
    let outcome = classify(&manifest, &ipsw, "n56ap", &ap_ticket, erase_identity).unwrap();

    assert_eq!(outcome.identity.restore_behavior().unwrap(), RestoreBehavior::Erase);
    assert!(!outcome.flag_custom);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn rerestore_swaps_to_update_when_erase_does_not_match()
{
    let dir = scratch_dir("update-match");
    let ipsw_path = dir.join("fixture.ipsw");

    let erase_body = b"erase-ramdisk-contents";
    let update_body = b"update-ramdisk-contents";
    let update_image = image_with_body(update_body);
    write_ipsw_fixture(
        &ipsw_path,
        &[("ramdisk-erase.dmg", &image_with_body(erase_body)), ("ramdisk-update.dmg", &update_image)],
    );

    let manifest = BuildManifest::from_bytes(&two_behavior_manifest()).unwrap();
    let ipsw = Ipsw::open(&ipsw_path).unwrap();
    let erase_identity = manifest.get_identity_by_model_behavior("n56ap", Some(RestoreBehavior::Erase)).unwrap();

    // The ticket only digests the Update ramdisk; starting from Erase forces a swap.
    let ap_ticket = ticket_embedding(&SignedImage::new(&update_image).body_digest());
    let outcome = classify(&manifest, &ipsw, "n56ap", &ap_ticket, erase_identity.clone()).unwrap();

    assert_eq!(outcome.identity.restore_behavior().unwrap(), RestoreBehavior::Update);
    assert!(!outcome.flag_custom);

    // Idempotence: re-running from the same starting point reaches the same conclusion.
    let second = classify(&manifest, &ipsw, "n56ap", &ap_ticket, erase_identity).unwrap();
    assert_eq!(second.identity.restore_behavior().unwrap(), RestoreBehavior::Update);
    assert_eq!(second.flag_custom, outcome.flag_custom);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn rerestore_declares_custom_for_unsigned_ramdisk()
{
    let dir = scratch_dir("custom-ramdisk");
    let ipsw_path = dir.join("fixture.ipsw");

    write_ipsw_fixture(
        &ipsw_path,
        &[
            ("ramdisk-erase.dmg", &unsigned_image(b"homebrew-ramdisk")),
            ("ramdisk-update.dmg", &image_with_body(b"update-ramdisk-contents")),
        ],
    );

    let manifest = BuildManifest::from_bytes(&two_behavior_manifest()).unwrap();
    let ipsw = Ipsw::open(&ipsw_path).unwrap();
    let erase_identity = manifest.get_identity_by_model_behavior("n56ap", Some(RestoreBehavior::Erase)).unwrap();

    // The ticket is irrelevant once the ramdisk itself reports unsigned.
    let ap_ticket = vec![0u8; 64];
    let outcome = classify(&manifest, &ipsw, "n56ap", &ap_ticket, erase_identity).unwrap();

    assert_eq!(outcome.identity.restore_behavior().unwrap(), RestoreBehavior::Erase);
    assert!(outcome.flag_custom);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn ticket_cache_round_trips_through_save_and_fetch()
{
    let dir = scratch_dir("ticket-cache");
    let paths = CachePaths::new(dir.clone());

    let mut dict = Dictionary::new();
    dict.insert("APTicket".to_string(), Value::Data(vec![0xAA, 0xBB, 0xCC, 0xDD]));
    let mut xml = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut xml).unwrap();
    let ticket = Ticket::from_cache_bytes(&xml).unwrap();

    let key = TicketKey {
        ecid: 0xDEAD_BEEF,
        product_type: "iPhone5,2".to_string(),
        product_version: "9.3.5".to_string(),
        build_version: "13G36".to_string(),
    };

    let client = TicketClient::new(Client::new());
    client.save_ticket(&paths, &key, &ticket).unwrap();

    // rerestore=true consults the cache first; an empty request dict never has to be sent
    // anywhere because the cache hit returns before any network call is attempted.
    let loaded = client.fetch(&paths, &key, &Dictionary::new(), true).unwrap();
    assert_eq!(loaded.ap_ticket_bytes().unwrap(), ticket.ap_ticket_bytes().unwrap());

    let _ = fs::remove_dir_all(&dir);
}
