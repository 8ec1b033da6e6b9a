// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! CLI entry point: wires the mode controller, manifest resolver, ticket client, re-restore
//! classifier, personalizer, and baseband resolver together into a single restore session.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{crate_description, crate_version, CommandFactory, Parser};
use clap_complete::{generate, Shell};
use color_eyre::config::HookBuilder;
use color_eyre::eyre::{EyreHandler, InstallError, Result};
use log::{debug, info, warn};
use owo_colors::OwoColorize;
use reqwest::blocking::Client;

use fwrestore::baseband;
use fwrestore::cache::{self, CachePaths};
use fwrestore::device::{DeviceMatcher, Mode, ModeController};
use fwrestore::error::{Error, ErrorKind};
use fwrestore::ipsw::Ipsw;
use fwrestore::manifest::{BuildManifest, RestoreBehavior};
use fwrestore::personalizer;
use fwrestore::rerestore;
use fwrestore::ticket::{self, TicketClient, TicketKey, TicketRequestInputs};
use fwrestore::version_catalogue::VersionCatalogue;
use fwrestore::{RerestoreMode, SessionOptions};

const BUILD_MANIFEST_ENTRY: &str = "BuildManifest.plist";

/// Components sent to the device in the order the second-stage bring-up needs them.
const RECOVERY_COMPONENTS: &[&str] = &["iBSS", "iBEC"];
const RESTORE_COMPONENTS: &[&str] =
    &["DeviceTree", "AppleLogo", "RestoreDeviceTree", "RestoreKernelCache", "RestoreRamDisk", "KernelCache"];

#[derive(Parser)]
#[command(version, about = format!("{} v{}", crate_description!(), crate_version!()))]
struct CliArguments
{
    /// Path to the IPSW firmware archive to restore from.
    ipsw: Option<PathBuf>,

    /// Use a cached/expired ticket and run the re-restore classifier instead of fetching a live one.
    #[arg(long)]
    rerestore: bool,

    /// Enable verbose (debug-level) logging.
    #[arg(long)]
    debug: bool,

    /// Keep a copy of every personalized component under the cache directory for inspection.
    #[arg(long)]
    keep_pers: bool,

    /// Fetch and cache a signing ticket, then exit without touching the device.
    #[arg(long)]
    tss_save_only: bool,

    /// Override the default platform cache directory.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Restore the nth attached Apple device found (unstable across reconnects).
    #[arg(long)]
    index: Option<usize>,

    /// Restore the device with this ECID (hex, as printed by `--debug`).
    #[arg(long, value_parser = parse_hex_ecid)]
    serial: Option<u64>,

    /// Print a shell completion script for the given shell and exit.
    #[arg(long)]
    completions: Option<Shell>,
}

fn parse_hex_ecid(value: &str) -> Result<u64, String>
{
    u64::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

type EyreHookFunc = Box<dyn Fn(&(dyn std::error::Error + 'static)) -> Box<dyn EyreHandler> + Send + Sync + 'static>;
type PanicHookFunc = Box<dyn Fn(&std::panic::PanicHookInfo<'_>) + Send + Sync + 'static>;

struct FwrestoreHook
{
    inner_hook: EyreHookFunc,
}

struct FwrestorePanic
{
    inner_hook: PanicHookFunc,
}

struct FwrestoreHandler
{
    inner_handler: Box<dyn EyreHandler>,
}

impl FwrestoreHook
{
    fn build_handler(&self, error: &(dyn std::error::Error + 'static)) -> FwrestoreHandler
    {
        FwrestoreHandler { inner_handler: (*self.inner_hook)(error) }
    }

    pub fn install(self) -> Result<(), InstallError>
    {
        color_eyre::eyre::set_hook(self.into_eyre_hook())
    }

    pub fn into_eyre_hook(self) -> EyreHookFunc
    {
        Box::new(move |err| Box::new(self.build_handler(err)))
    }
}

impl FwrestorePanic
{
    pub fn install(self)
    {
        std::panic::set_hook(self.into_panic_hook());
    }

    pub fn into_panic_hook(self) -> PanicHookFunc
    {
        Box::new(move |panic_info| {
            self.print_header();
            (*self.inner_hook)(panic_info);
            self.print_footer();
        })
    }

    fn print_header(&self)
    {
        eprintln!("------------[ ✂ cut here ✂ ]------------");
        eprintln!("Unhandled crash in fwrestore v{}", crate_version!());
        eprintln!();
    }

    fn print_footer(&self)
    {
        eprintln!();
        eprintln!("{}", "Please attach everything above this line when filing an issue.".yellow());
    }
}

impl EyreHandler for FwrestoreHandler
{
    fn debug(&self, error: &(dyn std::error::Error + 'static), fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result
    {
        writeln!(fmt, "------------[ ✂ cut here ✂ ]------------")?;
        write!(fmt, "Unhandled crash in fwrestore v{}", crate_version!())?;
        self.inner_handler.debug(error, fmt)?;
        writeln!(fmt)?;
        writeln!(fmt)?;
        write!(fmt, "{}", "Please attach everything above this line when filing an issue.".yellow())
    }

    fn track_caller(&mut self, location: &'static std::panic::Location<'static>)
    {
        self.inner_handler.track_caller(location);
    }
}

fn install_error_handler() -> Result<()>
{
    let default_handler = HookBuilder::default();
    let (panic_hook, eyre_hook) = default_handler.try_into_hooks()?;

    FwrestorePanic { inner_hook: panic_hook.into_panic_hook() }.install();
    FwrestoreHook { inner_hook: eyre_hook.into_eyre_hook() }.install()?;
    Ok(())
}

fn main() -> Result<()>
{
    install_error_handler()?;

    let cli_args = CliArguments::parse();

    if let Some(shell) = cli_args.completions {
        generate(shell, &mut CliArguments::command(), "fwrestore", &mut std::io::stdout());
        return Ok(());
    }

    let ipsw_path = cli_args.ipsw.clone().ok_or_else(|| {
        color_eyre::eyre::eyre!("the IPSW path is required unless --completions is given")
    })?;

    env_logger::Builder::new()
        .filter_level(if cli_args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .parse_default_env()
        .init();

    let options = SessionOptions {
        rerestore: if cli_args.rerestore { RerestoreMode::Rerestore } else { RerestoreMode::Normal },
        keep_pers: cli_args.keep_pers,
        tss_save_only: cli_args.tss_save_only,
        cache_dir: match &cli_args.cache_dir {
            Some(dir) => dir.clone(),
            None => cache::default_cache_dir()?,
        },
    };

    if let Err(e) = run(&ipsw_path, cli_args.index, cli_args.serial, &options) {
        log::error!("{e}");
        std::process::exit(e.kind.exit_code());
    }

    Ok(())
}

/// Resolves the stage-0 loader for a WTF-mode device: the archive-embedded entry named from the
/// device's CPID is tried first, falling back to the version catalogue's WTF URL, falling back
/// to the hardcoded URL if the catalogue has none either.
fn resolve_wtf_loader(ipsw: &Ipsw, client: &Client, paths: &CachePaths, cpid: Option<u16>) -> Result<Vec<u8>, Error>
{
    if let Some(cpid) = cpid {
        let entry = format!("Firmware/dfu/WTF.s5l{cpid:04x}xall.RELEASE.dfu");
        match ipsw.extract_to_memory(&entry) {
            Ok(bytes) => {
                info!("using archive-embedded WTF loader at {entry}");
                return Ok(bytes);
            },
            Err(e) => debug!("archive has no embedded WTF loader at {entry} (continuing): {e}"),
        }
    }

    let catalogue = VersionCatalogue::fetch_or_cached(paths, client)?;
    let loader_url = catalogue.wtf_url().unwrap_or_else(|_| VersionCatalogue::hardcoded_wtf_url().to_string());
    info!("fetching stage-0 WTF loader from {loader_url}");
    Ok(client.get(&loader_url).send()?.error_for_status()?.bytes()?.to_vec())
}

fn run(ipsw_path: &std::path::Path, index: Option<usize>, serial: Option<u64>, options: &SessionOptions) -> Result<(), Error>
{
    fs::create_dir_all(&options.cache_dir)?;
    let paths = CachePaths::new(options.cache_dir.clone());
    let client = Client::builder().timeout(Duration::from_secs(60)).build()?;

    info!("opening {}", ipsw_path.display());
    let ipsw = Ipsw::open(ipsw_path)?;
    let manifest_bytes = ipsw.extract_to_memory(BUILD_MANIFEST_ENTRY)?;
    let manifest = BuildManifest::from_bytes(&manifest_bytes)?;
    let version_info = manifest.get_version_info()?;
    info!("archive is {} ({})", version_info.product_version, version_info.build_version);

    let mut controller = ModeController::new(DeviceMatcher::new(index, serial));
    let mut mode = controller.detect()?;
    if mode == Mode::Unknown {
        return Err(ErrorKind::DeviceNotFound.error());
    }
    info!("device detected in {mode} mode");

    controller.ensure_exit_restore()?;
    mode = controller.mode();

    let (product_type, hardware_model) = {
        let driver = controller.driver().ok_or_else(|| ErrorKind::DeviceNotFound.error())?;
        (driver.get_product_type().to_string(), driver.get_hardware_model().to_string())
    };
    manifest.check_compatibility(&product_type)?;

    if controller.driver().is_some_and(|d| d.is_image4_supported()) {
        return Err(ErrorKind::UnsupportedDevice.error());
    }

    if mode == Mode::Wtf {
        let cpid = controller.driver().and_then(|d| d.cpid());
        let loader = resolve_wtf_loader(&ipsw, &client, &paths, cpid)?;
        mode = controller.wtf_bootstrap(&loader)?;
    }

    let initial_identity = manifest.get_identity_by_model_behavior(&hardware_model, Some(RestoreBehavior::Erase))?;

    let (ap_nonce, ap_sep_nonce) = {
        let driver = controller.driver().ok_or_else(|| ErrorKind::DeviceNotFound.error())?;
        (driver.get_ap_nonce().ok(), driver.get_sep_nonce().ok())
    };
    let ecid = controller.driver().ok_or_else(|| ErrorKind::DeviceNotFound.error())?.get_ecid();

    let request = ticket::build_request(&TicketRequestInputs {
        ecid,
        ap_nonce: ap_nonce.as_deref(),
        ap_sep_nonce: ap_sep_nonce.as_deref(),
        identity: &initial_identity,
        baseband_preflight: None,
    })?;

    let key = TicketKey {
        ecid,
        product_type: product_type.clone(),
        product_version: version_info.product_version.clone(),
        build_version: version_info.build_version.clone(),
    };

    let ticket_client = TicketClient::new(client.clone());
    let rerestore = options.rerestore == RerestoreMode::Rerestore;
    let ticket = ticket_client.fetch(&paths, &key, &request, rerestore)?;
    ticket_client.save_ticket(&paths, &key, &ticket)?;

    if options.tss_save_only {
        info!("ticket cached; exiting (--tss-save-only)");
        return Ok(());
    }

    let ap_ticket_bytes = ticket.ap_ticket_bytes()?.to_vec();

    let identity = if rerestore {
        let outcome = rerestore::classify(&manifest, &ipsw, &hardware_model, &ap_ticket_bytes, initial_identity)?;
        if outcome.flag_custom {
            warn!("ticket does not match either known ramdisk variant; treating this as a custom restore");
        }
        outcome.identity
    } else {
        initial_identity
    };

    if rerestore {
        let work_dir = paths.root().join("baseband");
        match baseband::resolve(
            &client,
            &VersionCatalogue::fetch_or_cached(&paths, &client)?,
            &ipsw,
            &manifest,
            &product_type,
            &hardware_model,
            identity.restore_behavior()?,
            &work_dir,
        ) {
            Ok(source) => debug!("baseband resolved at {}", source.path().display()),
            Err(e) => warn!("baseband resolution skipped: {e}"),
        }
    }

    if mode != Mode::Dfu && mode != Mode::Recovery {
        return Err(ErrorKind::DeviceSeemsInvalid(format!("cannot restore from {mode} mode")).error());
    }

    if mode == Mode::Dfu {
        let mut recovery_payloads = Vec::new();
        for component in RECOVERY_COMPONENTS {
            let path = identity.get_component_path(component)?;
            let raw = ipsw.extract_to_memory(path)?;
            let personalized = personalizer::personalize_and_maybe_keep(&paths, component, &raw, &ticket, options.keep_pers)?;
            recovery_payloads.push(personalized);
        }

        let ibss = recovery_payloads.first().ok_or_else(|| ErrorKind::ManifestShape("no iBSS component".to_string()).error())?;
        controller.driver().ok_or_else(|| ErrorKind::DeviceNotFound.error())?.send_buffer(ibss)?;

        let ibec = recovery_payloads.get(1).ok_or_else(|| ErrorKind::ManifestShape("no iBEC component".to_string()).error())?;
        controller.enter_recovery(Some(ibec), Some(&ap_ticket_bytes), version_info.build_major)?;
    }

    info!("device in Recovery mode; sending restore-time components");
    for component in RESTORE_COMPONENTS {
        let Ok(path) = identity.get_component_path(component) else { continue };
        let raw = ipsw.extract_to_memory(path)?;
        let personalized = personalizer::personalize_and_maybe_keep(&paths, component, &raw, &ticket, options.keep_pers)?;
        controller.driver().ok_or_else(|| ErrorKind::DeviceNotFound.error())?.send_buffer(&personalized)?;
    }

    controller.enter_restore()?;
    info!("restore started; device will reboot once complete");

    Ok(())
}
