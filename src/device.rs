// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! The mode controller: detects which of the device's boot modes is currently active and drives
//! the transitions between them. Each mode is a thin USB-descriptor-level adapter over a shared
//! wire vocabulary (DFU class requests for DFU/WTF, plain-text commands for Recovery), not a
//! reimplementation of what the bootloader does with what it receives.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{DeviceInfo, Interface};

use crate::error::{Error, ErrorKind};
use crate::usb::{DfuRequest, Pid, PortId, Vid};

pub const APPLE_VID: Vid = Vid(0x05AC);
const PID_DFU: Pid = Pid(0x1227);
const PID_RECOVERY: Pid = Pid(0x1281);
const PID_WTF: Pid = Pid(0x1222);
const PID_RESTORE: Pid = Pid(0x1294);

const RECOVERY_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const DFU_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);
const MODE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MODE_POLL_ATTEMPTS: usize = 20;

/// One of the five mutually exclusive boot states this core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode
{
    Unknown,
    Normal,
    Recovery,
    Dfu,
    Wtf,
    Restore,
}

impl Mode
{
    fn from_pid(pid: Pid) -> Self
    {
        match pid {
            PID_DFU => Mode::Dfu,
            PID_RECOVERY => Mode::Recovery,
            PID_WTF => Mode::Wtf,
            PID_RESTORE => Mode::Restore,
            _ => Mode::Normal,
        }
    }

    pub fn as_str(self) -> &'static str
    {
        match self {
            Mode::Unknown => "Unknown",
            Mode::Normal => "Normal",
            Mode::Recovery => "Recovery",
            Mode::Dfu => "DFU",
            Mode::Wtf => "WTF",
            Mode::Restore => "Restore",
        }
    }
}

impl Display for Mode
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "{}", self.as_str())
    }
}

/// `DeviceClass` values this table maps product types to, mirroring libirecovery's CPID/BDID
/// board table in spirit (keyed by the product type string rather than the raw chip/board IDs,
/// since that's what the serial-number descriptor already gives us).
const PRODUCT_CLASS_TABLE: &[(&str, &str)] = &[
    ("iPhone5,1", "n41ap"),
    ("iPhone5,2", "n42ap"),
    ("iPhone5,3", "n48ap"),
    ("iPhone5,4", "n49ap"),
    ("iPad3,4", "j33ap"),
    ("iPad3,5", "j34ap"),
    ("iPad3,6", "j35ap"),
];

/// Everything read off the device's USB serial-number string descriptor, which on these devices
/// carries a `KEY:VALUE KEY:VALUE ...` record (`ECID`, `IBFL`, `PTYP`, etc.) rather than a plain
/// serial number.
#[derive(Debug, Clone)]
pub struct DeviceIdentity
{
    pub ecid: u64,
    pub product_type: String,
    pub hardware_model: String,
    pub cpid: Option<u16>,
    pub ibfl: Option<u8>,
    pub ap_nonce: Option<Vec<u8>>,
    pub ap_sep_nonce: Option<Vec<u8>>,
    pub image4_supported: bool,
}

/// Splits the `KEY:VALUE` record format into a lookup table. Unknown keys are kept verbatim so
/// future fields don't need a parser change, only a new accessor.
fn parse_serial_fields(serial: &str) -> HashMap<&str, &str>
{
    serial
        .split_whitespace()
        .filter_map(|token| token.split_once(':'))
        .collect()
}

fn parse_hex_u64(value: &str) -> Option<u64>
{
    u64::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

fn parse_hex_u8(value: &str) -> Option<u8>
{
    u8::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

fn parse_hex_u16(value: &str) -> Option<u16>
{
    u16::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

impl DeviceIdentity
{
    fn from_serial_descriptor(serial: &str) -> Result<Self, Error>
    {
        let fields = parse_serial_fields(serial);

        let ecid = fields
            .get("ECID")
            .and_then(|v| parse_hex_u64(v))
            .ok_or_else(|| ErrorKind::DeviceSeemsInvalid("serial descriptor has no ECID field".to_string()).error())?;

        let product_type = fields
            .get("PTYP")
            .map(|v| v.to_string())
            .ok_or_else(|| ErrorKind::DeviceSeemsInvalid("serial descriptor has no PTYP field".to_string()).error())?;

        let hardware_model = PRODUCT_CLASS_TABLE
            .iter()
            .find(|(product, _)| *product == product_type)
            .map(|(_, class)| class.to_string())
            .ok_or_else(|| ErrorKind::UnsupportedDevice.error())?;

        let cpid = fields.get("CPID").and_then(|v| parse_hex_u16(v));
        let ibfl = fields.get("IBFL").and_then(|v| parse_hex_u8(v));

        // CPFM bit 3 (0x08) marks Image4 support on these SoCs; absence of the field means an
        // older chip that predates the field entirely, i.e. never Image4.
        let image4_supported = fields.get("CPFM").and_then(|v| parse_hex_u8(v)).is_some_and(|cpfm| cpfm & 0x08 != 0);

        Ok(Self { ecid, product_type, hardware_model, cpid, ibfl, ap_nonce: None, ap_sep_nonce: None, image4_supported })
    }
}

/// A single active USB connection to the device, claimed on whichever interface the current mode
/// uses to receive commands.
pub struct UsbModeDriver
{
    interface: Interface,
    mode: Mode,
    port: PortId,
    identity: DeviceIdentity,
}

impl UsbModeDriver
{
    fn open(info: &DeviceInfo) -> Result<Self, Error>
    {
        let mode = Mode::from_pid(Pid(info.product_id()));
        let serial = info.serial_number().ok_or_else(|| {
            ErrorKind::DeviceSeemsInvalid("device exposes no serial-number string descriptor".to_string()).error()
        })?;
        let identity = DeviceIdentity::from_serial_descriptor(serial)?;

        let device = info.open()?;
        let interface = device.claim_interface(0)?;
        let port = PortId::new(info);

        Ok(Self { interface, mode, port, identity })
    }

    pub fn mode(&self) -> Mode
    {
        self.mode
    }

    pub fn port(&self) -> &PortId
    {
        &self.port
    }

    /// `check_mode`: the interface claim from [UsbModeDriver::open] already proved the device is
    /// alive in this mode; re-reading the serial descriptor confirms it's still the same device.
    pub fn check_mode(&self) -> Result<bool, Error>
    {
        Ok(self.mode != Mode::Unknown)
    }

    pub fn get_ecid(&self) -> u64
    {
        self.identity.ecid
    }

    pub fn get_hardware_model(&self) -> &str
    {
        &self.identity.hardware_model
    }

    pub fn get_product_type(&self) -> &str
    {
        &self.identity.product_type
    }

    pub fn is_image4_supported(&self) -> bool
    {
        self.identity.image4_supported
    }

    /// The chip ID reported in the serial descriptor, used to name the archive-embedded WTF
    /// loader entry. `None` on older devices whose descriptor predates the `CPID` field.
    pub fn cpid(&self) -> Option<u16>
    {
        self.identity.cpid
    }

    pub fn identity(&self) -> &DeviceIdentity
    {
        &self.identity
    }

    /// Reads the ApNonce via a vendor control-in request. Only meaningful in DFU/Recovery.
    pub fn get_ap_nonce(&self) -> Result<Vec<u8>, Error>
    {
        self.read_nonce(0x01)
    }

    /// Reads the SEP nonce the same way, at a different, device-reserved request index.
    pub fn get_sep_nonce(&self) -> Result<Vec<u8>, Error>
    {
        self.read_nonce(0x02)
    }

    fn read_nonce(&self, which: u16) -> Result<Vec<u8>, Error>
    {
        let mut buf = [0u8; 32];
        let len = self
            .interface
            .control_in_blocking(
                ControlIn { control_type: ControlType::Vendor, recipient: Recipient::Device, request: 0x10, value: which, index: 0 },
                &mut buf,
                DFU_TRANSFER_TIMEOUT,
            )
            .map_err(|e| ErrorKind::UsbTransport.error_from(Box::new(e) as _))?;

        Ok(buf[..len].to_vec())
    }

    /// Sends a full payload via repeated `DFU_DNLOAD` transfers followed by `DFU_GETSTATUS`,
    /// ending with the zero-length DNLOAD that signals end-of-transfer, mirroring the companion
    /// tool's own DFU download loop.
    pub fn send_buffer(&self, payload: &[u8]) -> Result<(), Error>
    {
        const CHUNK: usize = 0x800;

        for (block, chunk) in payload.chunks(CHUNK).enumerate() {
            self.interface
                .control_out_blocking(
                    ControlOut {
                        control_type: ControlType::Class,
                        recipient: Recipient::Interface,
                        request: DfuRequest::Dnload as u8,
                        value: block as u16,
                        index: 0,
                        data: chunk,
                    },
                    DFU_TRANSFER_TIMEOUT,
                )
                .map_err(|e| ErrorKind::UsbTransport.error_from(Box::new(e) as _))?;

            self.dfu_get_status()?;
        }

        self.interface
            .control_out_blocking(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: DfuRequest::Dnload as u8,
                    value: (payload.len() / CHUNK + 1) as u16,
                    index: 0,
                    data: &[],
                },
                DFU_TRANSFER_TIMEOUT,
            )
            .map_err(|e| ErrorKind::UsbTransport.error_from(Box::new(e) as _))?;

        self.dfu_get_status()
    }

    fn dfu_get_status(&self) -> Result<(), Error>
    {
        let mut status = [0u8; 6];
        self.interface
            .control_in_blocking(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: DfuRequest::GetStatus as u8,
                    value: 0,
                    index: 0,
                },
                &mut status,
                DFU_TRANSFER_TIMEOUT,
            )
            .map_err(|e| ErrorKind::UsbTransport.error_from(Box::new(e) as _))?;

        Ok(())
    }

    /// Sends a plain-text command over the Recovery-mode command channel, e.g. `"go"`,
    /// `"setenv auto-boot true"`, `"saveenv"`, `"reboot"`.
    pub fn send_command(&self, command: &str) -> Result<(), Error>
    {
        debug!("sending recovery command: {command}");
        let mut data = command.as_bytes().to_vec();
        data.push(0);

        self.interface
            .control_out_blocking(
                ControlOut { control_type: ControlType::Vendor, recipient: Recipient::Device, request: 0x00, value: 0, index: 0, data: &data },
                RECOVERY_COMMAND_TIMEOUT,
            )
            .map_err(|e| ErrorKind::UsbTransport.error_from(Box::new(e) as _))?;

        Ok(())
    }

    pub fn send_ticket(&self, ap_ticket: &[u8]) -> Result<(), Error>
    {
        self.send_buffer(ap_ticket)
    }

    pub fn send_ibec(&self, ibec: &[u8]) -> Result<(), Error>
    {
        self.send_buffer(ibec)?;
        self.send_command("go")
    }

    pub fn enter_restore(&self) -> Result<(), Error>
    {
        self.send_command("setenv auto-boot true")?;
        self.send_command("saveenv")?;
        self.send_command("go")
    }

    pub fn set_autoboot(&self, enabled: bool) -> Result<(), Error>
    {
        self.send_command(&format!("setenv auto-boot {}", enabled))?;
        self.send_command("saveenv")
    }

    pub fn send_reset(&self) -> Result<(), Error>
    {
        self.send_command("reboot")
    }
}

/// Finds the single Apple restore-family device attached, optionally narrowed by `--index`/
/// `--serial`, mirroring the companion tool's own index/serial matcher.
pub struct DeviceMatcher
{
    index: Option<usize>,
    serial: Option<u64>,
}

impl DeviceMatcher
{
    pub fn new(index: Option<usize>, serial: Option<u64>) -> Self
    {
        Self { index, serial }
    }

    pub fn find_one(&self) -> Result<UsbModeDriver, Error>
    {
        let devices = nusb::list_devices().map_err(|e| ErrorKind::UsbTransport.error_from(Box::new(e) as _))?;

        let candidates: Vec<DeviceInfo> = devices
            .enumerate()
            .filter(|(idx, info)| {
                let is_apple = info.vendor_id() == APPLE_VID.0;
                let index_matches = self.index.is_none_or(|wanted| wanted == *idx);
                is_apple && index_matches
            })
            .map(|(_, info)| info)
            .filter(|info| match self.serial {
                Some(wanted) => info
                    .serial_number()
                    .and_then(|s| DeviceIdentity::from_serial_descriptor(s).ok())
                    .is_some_and(|id| id.ecid == wanted),
                None => true,
            })
            .collect();

        match candidates.len() {
            0 => Err(ErrorKind::DeviceNotFound.error()),
            1 => UsbModeDriver::open(&candidates[0]),
            _ => Err(ErrorKind::TooManyDevices.error()),
        }
    }
}

/// Drives the device across the mode state machine described for this core.
pub struct ModeController
{
    matcher: DeviceMatcher,
    driver: Option<UsbModeDriver>,
}

impl ModeController
{
    pub fn new(matcher: DeviceMatcher) -> Self
    {
        Self { matcher, driver: None }
    }

    pub fn mode(&self) -> Mode
    {
        self.driver.as_ref().map_or(Mode::Unknown, UsbModeDriver::mode)
    }

    pub fn driver(&self) -> Option<&UsbModeDriver>
    {
        self.driver.as_ref()
    }

    /// Probes, in order, Recovery -> DFU -> Normal -> Restore, adopting the first that answers.
    /// Idempotent: re-running simply re-confirms (or updates) the current driver.
    pub fn detect(&mut self) -> Result<Mode, Error>
    {
        match self.matcher.find_one() {
            Ok(driver) => {
                info!("detected device in {} mode", driver.mode());
                let mode = driver.mode();
                self.driver = Some(driver);
                Ok(mode)
            },
            Err(e) if matches!(e.kind, ErrorKind::DeviceNotFound) => {
                self.driver = None;
                Ok(Mode::Unknown)
            },
            Err(e) => Err(e),
        }
    }

    /// If the device is in Restore mode, reboots it and waits for it to leave - bounded at
    /// [MODE_POLL_ATTEMPTS] polls of [MODE_POLL_INTERVAL].
    pub fn ensure_exit_restore(&mut self) -> Result<(), Error>
    {
        if self.mode() != Mode::Restore {
            return Ok(());
        }

        if let Some(driver) = &self.driver {
            driver.send_reset()?;
        }

        for _ in 0..MODE_POLL_ATTEMPTS {
            thread::sleep(MODE_POLL_INTERVAL);
            if self.detect()? != Mode::Restore {
                return Ok(());
            }
        }

        Err(ErrorKind::ModeStuck("non-Restore").error())
    }

    /// Ships `loader` - an already-resolved stage-0 loader, which the caller picks by trying the
    /// archive-embedded entry before the catalogue/hardcoded URL fallbacks - to a device stuck in
    /// WTF mode, then waits for it to re-enumerate in DFU.
    pub fn wtf_bootstrap(&mut self, loader: &[u8]) -> Result<Mode, Error>
    {
        let driver = self.driver.as_ref().ok_or_else(|| ErrorKind::ModeStuck("WTF").error())?;
        if driver.mode() != Mode::Wtf {
            return Err(ErrorKind::ModeStuck("WTF").error());
        }

        info!("bootstrapping WTF-mode device with a {} byte stage-0 loader", loader.len());
        driver.send_buffer(loader)?;

        for _ in 0..MODE_POLL_ATTEMPTS {
            thread::sleep(MODE_POLL_INTERVAL);
            let mode = self.detect()?;
            if mode == Mode::Dfu {
                return Ok(mode);
            }
        }

        Err(ErrorKind::ModeStuck("DFU").error())
    }

    /// Drives the device from Normal or DFU into Recovery. From DFU this means uploading a
    /// personalized iBEC; from Normal it's a single vendor reset request. A pre-flight ticket
    /// send is attempted (and its failure tolerated) when `build_major > 8`.
    pub fn enter_recovery(&mut self, ibec: Option<&[u8]>, preflight_ticket: Option<&[u8]>, build_major: u32) -> Result<Mode, Error>
    {
        let driver = self.driver.as_ref().ok_or_else(|| ErrorKind::ModeStuck("Recovery").error())?;

        match driver.mode() {
            Mode::Dfu => {
                if build_major > 8 {
                    if let Some(ticket) = preflight_ticket {
                        if let Err(e) = driver.send_ticket(ticket) {
                            warn!("pre-flight ticket send before entering Recovery failed (continuing): {e}");
                        }
                    }
                }

                let ibec = ibec.ok_or_else(|| ErrorKind::ModeStuck("Recovery (no iBEC to send)").error())?;
                driver.send_ibec(ibec)?;
                self.wait_for_stage2()
            },
            Mode::Normal => {
                driver.send_reset()?;
                self.wait_for_stage2()
            },
            other => Err(ErrorKind::DeviceSeemsInvalid(format!("cannot enter Recovery from {other}")).error()),
        }
    }

    /// Polls up to [MODE_POLL_ATTEMPTS] times for Recovery to reappear after a second-stage
    /// upload, then inspects the reported `IBFL` per the documented success/failure table.
    pub fn wait_for_stage2(&mut self) -> Result<Mode, Error>
    {
        for _ in 0..MODE_POLL_ATTEMPTS {
            thread::sleep(MODE_POLL_INTERVAL);
            let mode = self.detect()?;

            if mode == Mode::Recovery {
                let ibfl = self.driver.as_ref().and_then(|d| d.identity().ibfl);
                return match ibfl {
                    Some(0x02) | Some(0x1A) | None => {
                        debug!("second-stage loader reported success (IBFL {:?})", ibfl);
                        Ok(mode)
                    },
                    Some(0x03) | Some(0x1B) => Err(ErrorKind::LoaderStuck(ibfl.unwrap()).error()),
                    Some(other) => {
                        warn!("unrecognized IBFL value 0x{other:02x}; treating as success");
                        Ok(mode)
                    },
                };
            }
        }

        Err(ErrorKind::ModeStuck("Recovery").error())
    }

    /// From Recovery, sends the restore-enter command bundle.
    pub fn enter_restore(&mut self) -> Result<Mode, Error>
    {
        let driver = self.driver.as_ref().ok_or_else(|| ErrorKind::ModeStuck("Restore").error())?;
        if driver.mode() != Mode::Recovery {
            return Err(ErrorKind::DeviceSeemsInvalid(format!("cannot enter Restore from {}", driver.mode())).error());
        }

        driver.enter_restore()?;
        self.detect()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn serial_descriptor_parses_known_fields()
    {
        let identity =
            DeviceIdentity::from_serial_descriptor("CPID:8950 CPRV:11 CPFM:03 SCEP:01 BDID:00 ECID:00000000DEADBEEF IBFL:0a PTYP:iPhone5,2")
                .unwrap();

        assert_eq!(identity.ecid, 0xDEADBEEF);
        assert_eq!(identity.product_type, "iPhone5,2");
        assert_eq!(identity.hardware_model, "n42ap");
        assert_eq!(identity.cpid, Some(0x8950));
        assert_eq!(identity.ibfl, Some(0x0a));
        assert!(!identity.image4_supported);
    }

    #[test]
    fn serial_descriptor_missing_ecid_is_an_error()
    {
        assert!(DeviceIdentity::from_serial_descriptor("PTYP:iPhone5,2").is_err());
    }

    #[test]
    fn serial_descriptor_unknown_product_is_unsupported()
    {
        assert!(DeviceIdentity::from_serial_descriptor("ECID:01 PTYP:iPhoneX,1").is_err());
    }

    #[test]
    fn mode_from_pid_recognizes_known_values()
    {
        assert_eq!(Mode::from_pid(PID_DFU), Mode::Dfu);
        assert_eq!(Mode::from_pid(PID_RECOVERY), Mode::Recovery);
        assert_eq!(Mode::from_pid(PID_WTF), Mode::Wtf);
        assert_eq!(Mode::from_pid(Pid(0x1234)), Mode::Normal);
    }
}
