// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! Personalization: stitches the per-component signing blob from a ticket onto the raw component
//! payload extracted from the IPSW, producing the Image3 container the device will accept.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::cache::CachePaths;
use crate::error::Error;
use crate::image3::img3_stitch;
use crate::ticket::Ticket;

/// Personalizes `payload` (the raw bytes of `component`, as extracted from the IPSW) using the
/// matching blob out of `ticket`. A component the ticket doesn't know about is passed through
/// unmodified - not every component in a manifest is actually signed (e.g. diagnostics images),
/// and that's expected rather than an error.
pub fn personalize(component: &str, payload: &[u8], ticket: &Ticket) -> Result<Vec<u8>, Error>
{
    match ticket.component_blob(component) {
        Some(blob) => {
            info!("personalizing {component} ({} bytes payload, {} bytes blob)", payload.len(), blob.len());
            img3_stitch(component, payload, blob)
        },
        None => {
            warn!("{component} is not personalized by this ticket; sending it unmodified");
            Ok(payload.to_vec())
        },
    }
}

/// Personalizes `component` and, when `keep` is set, also writes the result under the cache's
/// `personalized/` directory for offline inspection - a debugging aid, never consulted on a later
/// run.
pub fn personalize_and_maybe_keep(
    paths: &CachePaths,
    component: &str,
    payload: &[u8],
    ticket: &Ticket,
    keep: bool,
) -> Result<Vec<u8>, Error>
{
    let personalized = personalize(component, payload, ticket)?;

    if keep {
        let dest = paths.personalized_component(component);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        write_debug_copy(&dest, &personalized)?;
    }

    Ok(personalized)
}

fn write_debug_copy(dest: &Path, bytes: &[u8]) -> Result<(), Error>
{
    fs::write(dest, bytes)?;
    info!("kept personalized component at {}", dest.display());
    Ok(())
}

#[cfg(test)]
mod tests
{
    use plist::{Dictionary, Value};

    use super::*;

    fn ticket_with_blob(component: &str, blob: Vec<u8>) -> Ticket
    {
        let mut entry = Dictionary::new();
        entry.insert("Blob".to_string(), Value::Data(blob));
        let mut root = Dictionary::new();
        root.insert(component.to_string(), Value::Dictionary(entry));
        root.insert("APTicket".to_string(), Value::Data(vec![0xAA]));

        let mut bytes = Vec::new();
        Value::Dictionary(root).to_writer_xml(&mut bytes).unwrap();
        Ticket::from_cache_bytes(&bytes).unwrap()
    }

    fn image3_payload(body_len: usize) -> Vec<u8>
    {
        let data_size = (4 + body_len) as u32;

        let mut bytes = vec![0u8; 12];
        bytes[0..4].copy_from_slice(b"3gmI");
        bytes[4..8].copy_from_slice(&(12 + data_size).to_le_bytes());
        bytes.extend_from_slice(&data_size.to_le_bytes());
        bytes.extend(std::iter::repeat(0xAAu8).take(body_len));
        // room for the stitched signature blob
        bytes.extend(std::iter::repeat(0u8).take(64));
        bytes
    }

    #[test]
    fn personalize_stitches_matching_blob()
    {
        let ticket = ticket_with_blob("KernelCache", vec![0xBB; 64]);
        let payload = image3_payload(200);

        let out = personalize("KernelCache", &payload, &ticket).unwrap();
        assert_eq!(out.len(), payload.len());
        assert_ne!(out, payload);
    }

    #[test]
    fn personalize_passes_through_unknown_component()
    {
        let ticket = ticket_with_blob("KernelCache", vec![0xBB; 8]);
        let payload = vec![0x22; 32];

        let out = personalize("DeviceTree", &payload, &ticket).unwrap();
        assert_eq!(out, payload);
    }
}
