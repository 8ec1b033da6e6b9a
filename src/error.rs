// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! Module for error handling code.

use std::fmt::{Display, Formatter};
use std::error::Error as StdError;

use thiserror::Error;

use crate::S;

/// More convenient alias for `Box<dyn StdError + Send + Sync>`,
/// which shows up in a few signatures and structs.
type BoxedError = Box<dyn StdError + Send + Sync>;

/// Kinds of errors for [Error]. Use [ErrorKind::error] and [ErrorKind::error_from] to generate the
/// [Error] value for this ErrorKind.
#[derive(Debug)]
pub enum ErrorKind
{
    /// The device disappeared mid-transaction or returned a malformed response.
    UsbTransport,

    /// An expected mode transition did not complete within its retry budget.
    ModeStuck(/** which mode we were waiting for **/ &'static str),

    /// The second-stage loader reported failure via its IBFL status (0x03/0x1B).
    LoaderStuck(/** observed IBFL value **/ u8),

    /// A required key was missing from a build manifest, or had the wrong kind.
    ManifestShape(/** path within the manifest **/ String),

    /// The archive was missing an expected entry, or failed to decompress.
    ArchiveEntry(/** entry path **/ String),

    /// The signing service refused the request or returned an empty ticket.
    TicketUnavailable,

    /// The device has the new signed-image format bit set; this core cannot operate on it.
    UnsupportedDevice,

    /// The version catalogue could not be refreshed. Callers should fall back to any cached copy.
    VersionCatalogueDown,

    /// No device matching the requested selector (index/serial) was found.
    DeviceNotFound,

    /// The selector (index/serial) matched more than one device.
    TooManyDevices,

    /// Something about the connected device's responses doesn't make sense.
    DeviceSeemsInvalid(/** invalid thing **/ String),

    /// Unhandled external error.
    External(ErrorSource),
}

impl ErrorKind
{
    /// Creates a new [Error] from this error kind.
    ///
    /// Enables convenient code like:
    /// ```
    /// return Err(ErrorKind::TicketUnavailable.error());
    /// ```
    #[inline(always)]
    pub fn error(self) -> Error
    {
        Error::new(self, None)
    }

    /// Creates a new [Error] from this error kind, with the passed error as the source.
    #[inline(always)]
    pub fn error_from<E: StdError + Send + Sync + 'static>(self, source: E) -> Error
    {
        Error::new(self, Some(Box::new(source)))
    }

    /// The process exit code this error kind maps to, per the CLI's documented exit status table.
    /// `VersionCatalogueDown` never reaches this mapping: callers treat it as non-fatal and reuse
    /// whatever catalogue copy is already on disk.
    pub fn exit_code(&self) -> i32
    {
        use ErrorKind::*;
        match self {
            ManifestShape(_) => -1,
            ModeStuck(_) => -2,
            UsbTransport => -2,
            TicketUnavailable => -6,
            LoaderStuck(_) => -7,
            UnsupportedDevice => -8,
            ArchiveEntry(_) => -9,
            VersionCatalogueDown => -1,
            DeviceNotFound | TooManyDevices | DeviceSeemsInvalid(_) | External(_) => -1,
        }
    }
}

/// Constructs an [Error] for this [ErrorKind].
impl From<ErrorKind> for Error
{
    fn from(other: ErrorKind) -> Self
    {
        other.error()
    }
}

impl Display for ErrorKind
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
    {
        use ErrorKind::*;
        match self {
            UsbTransport => write!(f, "device disappeared or returned a malformed response")?,
            ModeStuck(mode) => write!(f, "device did not reach {} mode within the retry budget", mode)?,
            LoaderStuck(ibfl) => write!(f, "second-stage loader reported failure (IBFL 0x{:02x})", ibfl)?,
            ManifestShape(path) => write!(f, "build manifest missing or malformed key at {}", path)?,
            ArchiveEntry(path) => write!(f, "archive is missing expected entry {}", path)?,
            TicketUnavailable => write!(f, "signing service refused the request or returned an empty ticket")?,
            UnsupportedDevice => write!(f, "device reports the newer signed-image format; this tool only supports Image3 devices")?,
            VersionCatalogueDown => write!(f, "failed to refresh the version catalogue")?,
            DeviceNotFound => write!(f, "no matching device found (check connection and mode?)")?,
            TooManyDevices => write!(f, "selector matched more than one device; narrow with --index or --serial")?,
            DeviceSeemsInvalid(thing) => write!(f, "device returned unexpected data ({})", thing)?,
            External(source) => {
                use ErrorSource::*;
                match source {
                    StdIo(e) => write!(f, "unhandled I/O error: {}", e)?,
                    Usb(e) => write!(f, "unhandled USB error: {}", e)?,
                    Dfu(e) => write!(f, "unhandled DFU transfer error: {}", e)?,
                    Http(e) => write!(f, "unhandled HTTP error: {}", e)?,
                    Plist(e) => write!(f, "unhandled property-list error: {}", e)?,
                    Archive(e) => write!(f, "unhandled archive error: {}", e)?,
                };
            },
        };

        Ok(())
    }
}

#[derive(Debug)]
/// Error type for firmware-restore operations. Easily constructed from [ErrorKind].
pub struct Error
{
    pub kind: ErrorKind,
    pub source: Option<BoxedError>,

    /// A string for additional context about what was being attempted when this error occurred.
    ///
    /// Example: "sending iBEC to device".
    pub context: Option<String>,
}

impl Error
{
    #[inline(always)]
    pub fn new(kind: ErrorKind, source: Option<BoxedError>) -> Self
    {
        Self { kind, source, context: None }
    }

    /// Add additional context about what was being attempted when this error occurred.
    pub fn with_ctx(mut self, ctx: &str) -> Self
    {
        self.context = Some(ctx.to_string());
        self
    }
}

impl Display for Error
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
    {
        if let Some(ctx) = &self.context {
            write!(f, "(while {}): {}", ctx, self.kind)?;
        } else {
            write!(f, "{}", self.kind)?;
        }

        if let Some(source) = &self.source {
            write!(f, "\nCaused by: {}", source)?;
        }

        Ok(())
    }
}

impl StdError for Error
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)>
    {
        self.source.as_deref().map(|e| e as &dyn StdError)
    }
}

impl From<std::io::Error> for Error
{
    fn from(other: std::io::Error) -> Self
    {
        ErrorKind::External(ErrorSource::StdIo(other.into())).error()
    }
}

impl From<reqwest::Error> for Error
{
    fn from(other: reqwest::Error) -> Self
    {
        if other.is_connect() || other.is_timeout() {
            ErrorKind::VersionCatalogueDown.error_from(ErrorSource::Http(other).into_inner())
        } else {
            ErrorKind::External(ErrorSource::Http(other)).error()
        }
    }
}

impl From<plist::Error> for Error
{
    fn from(other: plist::Error) -> Self
    {
        ErrorKind::ManifestShape(S!("<plist parse error>")).error_from(ErrorSource::Plist(other).into_inner())
    }
}

impl From<rc_zip_sync::rc_zip::error::Error> for Error
{
    fn from(other: rc_zip_sync::rc_zip::error::Error) -> Self
    {
        ErrorKind::ArchiveEntry(S!("<archive error>")).error_from(ErrorSource::Archive(other).into_inner())
    }
}

impl From<nusb::Error> for Error
{
    fn from(other: nusb::Error) -> Self
    {
        ErrorKind::External(ErrorSource::Usb(other)).error()
    }
}

/// Sources of external error in this library.
#[derive(Debug, Error)]
pub enum ErrorSource
{
    #[error(transparent)]
    StdIo(#[from] std::io::Error),

    #[error(transparent)]
    Usb(#[from] nusb::Error),

    #[error("{0}")]
    Dfu(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Plist(#[from] plist::Error),

    #[error(transparent)]
    Archive(#[from] rc_zip_sync::rc_zip::error::Error),
}

impl ErrorSource
{
    /// Unwraps this source back into a plain boxed [StdError], for use as the `source` field of
    /// an [Error] whose [ErrorKind] already carries the descriptive context.
    fn into_inner(self) -> BoxedError
    {
        Box::new(self)
    }
}

#[macro_export]
macro_rules! log_and_return
{
    ($err:expr) => {
        let err = $err;
        log::error!("{}", err);
        return Err(err);
    }
}
