// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! Assembly, submission, and caching of per-device signing tickets ("TSS responses").

use std::cell::Cell;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use plist::{Dictionary, Value};
use reqwest::blocking::Client;

use crate::cache::CachePaths;
use crate::error::{Error, ErrorKind};
use crate::manifest::BuildIdentity;

const VENDOR_TSS_URL: &str = "https://gs.apple.com/TSS/controller?action=2";
const COMMUNITY_TSS_URL: &str = "http://cydia.saurik.com/TSS/controller?action=2";

/// `Nonce`/`ChipID`/`CertID`/`ChipSerialNo` read from the device while it's still in Normal mode,
/// remapped into the `Bb*` request keys the signing service expects. Only present when the
/// session started in Normal mode and the device actually has a baseband.
#[derive(Debug, Clone)]
pub struct BasebandPreflight
{
    pub nonce: Vec<u8>,
    pub chip_id: i64,
    pub cert_id: i64,
    pub chip_serial_no: Vec<u8>,
}

/// Everything needed to assemble a signing request for one identity.
pub struct TicketRequestInputs<'a>
{
    pub ecid: u64,
    pub ap_nonce: Option<&'a [u8]>,
    pub ap_sep_nonce: Option<&'a [u8]>,
    pub identity: &'a BuildIdentity,
    pub baseband_preflight: Option<&'a BasebandPreflight>,
}

/// Builds the request dictionary per the documented key table: device identity, nonces,
/// production-mode/image-format flags, the identity's common/ap/img3 component tags, and
/// (Normal mode only) baseband tags.
pub fn build_request(inputs: &TicketRequestInputs) -> Result<Dictionary, Error>
{
    let mut request = Dictionary::new();

    request.insert("ApECID".to_string(), Value::Integer((inputs.ecid as i64).into()));
    if let Some(nonce) = inputs.ap_nonce {
        request.insert("ApNonce".to_string(), Value::Data(nonce.to_vec()));
    }
    if let Some(nonce) = inputs.ap_sep_nonce {
        request.insert("ApSepNonce".to_string(), Value::Data(nonce.to_vec()));
    }
    request.insert("ApProductionMode".to_string(), Value::Boolean(true));
    request.insert("ApSupportsImg4".to_string(), Value::Boolean(false));

    for component in inputs.identity.component_names()? {
        let metadata = inputs.identity.component_metadata(&component)?;
        request.insert(component, Value::Dictionary(metadata));
    }

    if let Some(preflight) = inputs.baseband_preflight {
        request.insert("BbNonce".to_string(), Value::Data(preflight.nonce.clone()));
        request.insert("BbChipID".to_string(), Value::Integer(preflight.chip_id.into()));
        request.insert("BbGoldCertId".to_string(), Value::Integer(preflight.cert_id.into()));
        request.insert("BbSNUM".to_string(), Value::Data(preflight.chip_serial_no.clone()));
    }

    Ok(request)
}

/// The cache key a ticket is addressed by: (ECID, product type, product version, build version).
#[derive(Debug, Clone)]
pub struct TicketKey
{
    pub ecid: u64,
    pub product_type: String,
    pub product_version: String,
    pub build_version: String,
}

/// An opaque signing-service response. Component blobs and the overall `APTicket` bytes are
/// accessed by name; everything else is passed through unexamined.
#[derive(Debug, Clone)]
pub struct Ticket
{
    dict: Dictionary,
}

impl Ticket
{
    fn from_xml(bytes: &[u8]) -> Result<Self, Error>
    {
        let value = Value::from_reader(Cursor::new(bytes))?;
        let dict = value
            .into_dictionary()
            .ok_or_else(|| ErrorKind::TicketUnavailable.error())?;

        let mut ticket = Self { dict };
        ticket.apply_fixups();
        Ok(ticket)
    }

    pub fn from_cache_bytes(bytes: &[u8]) -> Result<Self, Error>
    {
        let value = Value::from_reader_xml(Cursor::new(bytes)).or_else(|_| Value::from_reader(Cursor::new(bytes)))?;
        let dict = value
            .into_dictionary()
            .ok_or_else(|| ErrorKind::TicketUnavailable.error())?;

        Ok(Self { dict })
    }

    /// Replaces `RestoreLogo`/`RestoreDeviceTree`/`RestoreKernelCache` with copies of
    /// `AppleLogo`/`DeviceTree`/`KernelCache` respectively, when present but empty - servers
    /// sometimes omit the restore-variant blobs outright.
    fn apply_fixups(&mut self)
    {
        const FIXUPS: &[(&str, &str)] =
            &[("RestoreLogo", "AppleLogo"), ("RestoreDeviceTree", "DeviceTree"), ("RestoreKernelCache", "KernelCache")];

        for (restore_key, live_key) in FIXUPS {
            let is_empty_dict = matches!(
                self.dict.get(*restore_key).and_then(Value::as_dictionary),
                Some(d) if d.is_empty()
            );

            if is_empty_dict {
                if let Some(replacement) = self.dict.get(*live_key).cloned() {
                    debug!("fixing up empty {restore_key} with a copy of {live_key}");
                    self.dict.insert((*restore_key).to_string(), replacement);
                }
            }
        }
    }

    pub fn ap_ticket_bytes(&self) -> Result<&[u8], Error>
    {
        self.dict
            .get("APTicket")
            .and_then(Value::as_data)
            .ok_or_else(|| ErrorKind::TicketUnavailable.error())
    }

    pub fn component_blob(&self, component: &str) -> Option<&[u8]>
    {
        self.dict.get(component).and_then(Value::as_dictionary)?.get("Blob").and_then(Value::as_data)
    }

    fn to_binary_plist(&self) -> Result<Vec<u8>, Error>
    {
        let mut buffer = Vec::new();
        Value::Dictionary(self.dict.clone()).to_writer_binary(&mut buffer)?;
        Ok(buffer)
    }
}

/// Submits signing requests and caches/loads tickets. Tracks, within a session, whether a
/// community-archive fetch has already succeeded - after that, every later request (e.g. a
/// nonce-changed re-fetch) goes straight to the vendor endpoint, mirroring the reference client's
/// endpoint-switch behaviour.
pub struct TicketClient
{
    client: Client,
    used_community_endpoint: Cell<bool>,
}

impl TicketClient
{
    pub fn new(client: Client) -> Self
    {
        Self { client, used_community_endpoint: Cell::new(false) }
    }

    /// Fetches a ticket for `key`/`request`. In re-restore mode, consults the local SHSH cache
    /// first, falling through to the community endpoint on a miss; in normal mode, goes straight
    /// to the vendor endpoint.
    pub fn fetch(
        &self,
        paths: &CachePaths,
        key: &TicketKey,
        request: &Dictionary,
        rerestore: bool,
    ) -> Result<Ticket, Error>
    {
        if rerestore {
            if let Some(ticket) = self.load_cached(paths, key)? {
                info!("using cached SHSH ticket for {}-{}", key.product_type, key.build_version);
                return Ok(ticket);
            }

            if !self.used_community_endpoint.get() {
                match self.submit(COMMUNITY_TSS_URL, request) {
                    Ok(ticket) => {
                        info!("fetched ticket from the community archive endpoint");
                        self.used_community_endpoint.set(true);
                        return Ok(ticket);
                    },
                    Err(e) => warn!("community archive endpoint did not have a ticket: {e}"),
                }
            }
        }

        info!("fetching ticket from the vendor signing endpoint");
        self.submit(VENDOR_TSS_URL, request)
    }

    fn submit(&self, url: &str, request: &Dictionary) -> Result<Ticket, Error>
    {
        let mut body = Vec::new();
        Value::Dictionary(request.clone()).to_writer_xml(&mut body)?;

        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("Expect", "")
            .timeout(Duration::from_secs(60))
            .body(body)
            .send()?;

        let bytes = response.error_for_status()?.bytes()?;
        if bytes.is_empty() {
            return Err(ErrorKind::TicketUnavailable.error());
        }

        Ticket::from_xml(&bytes)
    }

    fn shsh_path(&self, paths: &CachePaths, key: &TicketKey) -> PathBuf
    {
        paths.shsh_ticket(key.ecid, &key.product_type, &key.product_version, &key.build_version)
    }

    fn load_cached(&self, paths: &CachePaths, key: &TicketKey) -> Result<Option<Ticket>, Error>
    {
        let path = self.shsh_path(paths, key);
        if !path.exists() {
            return Ok(None);
        }

        let mut decoder = GzDecoder::new(File::open(&path)?);
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;

        Ok(Some(Ticket::from_cache_bytes(&bytes)?))
    }

    /// Writes a gz-compressed binary property-list ticket under the SHSH cache path, refusing to
    /// overwrite an existing file - the atomic-write discipline is "write once, never clobber".
    pub fn save_ticket(&self, paths: &CachePaths, key: &TicketKey, ticket: &Ticket) -> Result<PathBuf, Error>
    {
        let path = self.shsh_path(paths, key);
        if path.exists() {
            debug!("SHSH ticket already cached at {}", path.display());
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("shsh.tmp");
        let mut encoder = GzEncoder::new(File::create(&tmp_path)?, Compression::default());
        encoder.write_all(&ticket.to_binary_plist()?)?;
        encoder.finish()?;
        fs::rename(&tmp_path, &path)?;

        Ok(path)
    }
}
