//! Media Writer - download OS images and write them to USB drives and SD cards
//!
//! Command-line front end. The same binary doubles as the privileged helper
//! (`media-writer helper`), which the orchestrator starts for raw device jobs.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;

use media_writer::catalog::{
    self, Architecture, Channel, Checksum, ContainerType, Variant, VariantFilter, VariantSource,
};
use media_writer::config::Settings;
use media_writer::devices::{platform_backend, Availability, DriveManager};
use media_writer::download::DownloadEngine;
use media_writer::error::OrchestratorError;
use media_writer::flash::WritePhase;
use media_writer::helper::{serve_stdio, HelperLauncher, WorkerSettings};
use media_writer::orchestrator::{restore_drive, Orchestrator, OrchestratorEvent, VariantStatus};
use media_writer::utils::{file_name_from_url, format_size};
use media_writer::{log_error, log_info, logging};

const MODULE: &str = "main";

#[derive(Parser)]
#[command(name = "media-writer", version, about = "Download OS images and write them to removable drives")]
struct Cli {
    /// Settings file, defaults to the per-user config directory
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log at DEBUG level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List removable drives
    Drives,
    /// List the variants a catalog offers
    Variants(VariantArgs),
    /// Download an image and check it
    Download(ImageArgs),
    /// Write an image to a drive, downloading it first if needed
    Write {
        #[command(flatten)]
        image: ImageArgs,
        /// Drive id as printed by `drives`
        drive: String,
        /// Skip reading the drive back after writing
        #[arg(long)]
        no_verify: bool,
        /// Access the drive from this process instead of a helper process
        #[arg(long)]
        in_process: bool,
        /// Eject the drive once the image is written
        #[arg(long)]
        eject: bool,
    },
    /// Reformat a drive with a single empty FAT partition
    Restore {
        drive: String,
        #[arg(long)]
        in_process: bool,
    },
    /// Serve the helper protocol on stdin/stdout
    #[command(hide = true)]
    Helper,
}

#[derive(Args)]
struct ImageArgs {
    /// Local image file, image URL, or a variant id together with --catalog
    image: String,

    /// Catalog file or URL to look the variant id up in
    #[arg(long)]
    catalog: Option<String>,

    /// Expected digest of the download, `sha256:<hex>` or `sha512:<hex>`
    #[arg(long)]
    checksum: Option<String>,
}

#[derive(Args)]
struct VariantArgs {
    /// Catalog file or URL
    catalog: String,

    #[arg(long)]
    board: Option<String>,

    /// Architecture, e.g. aarch64 or amd64
    #[arg(long)]
    arch: Option<String>,

    /// alpha, beta, rc or stable
    #[arg(long)]
    channel: Option<String>,

    /// Print the boards instead of the variants
    #[arg(long)]
    boards: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init();

    let settings = match cli.settings.as_deref() {
        Some(path) => Settings::load(path),
        None => Settings::load_default(),
    };
    if cli.debug || settings.developer_mode {
        logging::set_log_level(true);
    }

    match run(cli.command, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_error!(MODULE, "{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, mut settings: Settings) -> Result<(), String> {
    match command {
        Command::Helper => serve_stdio(platform_backend(), WorkerSettings::from(&settings))
            .await
            .map_err(|e| e.to_string()),
        Command::Drives => list_drives(&settings).await,
        Command::Variants(args) => list_variants(&args).await,
        Command::Download(image) => {
            let session = Session::new(&settings, true);
            let orchestrator = session.orchestrator(resolve_variant(&image).await?, &settings)?;
            if orchestrator.status() == VariantStatus::ReadyToWrite {
                println!("{} is a local image, nothing to download", image.image);
                return Ok(());
            }
            with_progress(&orchestrator, orchestrator.download()).await?;
            println!("Downloaded {}", orchestrator.image_path().display());
            Ok(())
        }
        Command::Write {
            image,
            drive,
            no_verify,
            in_process,
            eject,
        } => {
            if no_verify {
                settings.verify_writes = false;
            }
            let session = Session::new(&settings, in_process);
            let _watcher = session.drives.watch();
            let drive = session.find_drive(&drive).await?;
            let orchestrator = session.orchestrator(resolve_variant(&image).await?, &settings)?;

            if orchestrator.status() == VariantStatus::Preparing {
                with_progress(&orchestrator, orchestrator.download()).await?;
            }
            with_progress(&orchestrator, orchestrator.write(&drive)).await?;
            println!("Wrote {} to {}", orchestrator.variant().display_name(), drive.display_name());
            if eject {
                session.drives.eject(&drive).await.map_err(|e| e.to_string())?;
                println!("Ejected {}, it can be removed now", drive.display_name());
            }
            Ok(())
        }
        Command::Restore { drive, in_process } => {
            let session = Session::new(&settings, in_process);
            let drive = session.find_drive(&drive).await?;
            restore_drive(&session.drives, &session.launcher, &drive)
                .await
                .map_err(|f| f.to_string())?;
            println!("Restored {}", drive.display_name());
            Ok(())
        }
    }
}

struct Session {
    drives: DriveManager,
    launcher: HelperLauncher,
}

impl Session {
    fn new(settings: &Settings, in_process: bool) -> Self {
        let backend = platform_backend();
        let drives = DriveManager::new(backend.clone(), settings.drive_poll_interval());
        let launcher = if in_process {
            HelperLauncher::InProcess {
                backend,
                settings: WorkerSettings::from(settings),
            }
        } else {
            HelperLauncher::Process {
                settings: settings.clone(),
            }
        };
        Self { drives, launcher }
    }

    async fn find_drive(&self, id: &str) -> Result<media_writer::devices::Drive, String> {
        self.drives.refresh().await;
        if let Availability::Broken(reason) = self.drives.availability() {
            return Err(format!("drive service unavailable: {}", reason));
        }
        self.drives
            .drive(id)
            .ok_or_else(|| format!("no removable drive with id {}", id))
    }

    fn orchestrator(&self, variant: Variant, settings: &Settings) -> Result<Orchestrator, String> {
        let engine = DownloadEngine::http(settings).map_err(|e| e.to_string())?;
        Ok(Orchestrator::new(
            variant,
            engine,
            self.drives.clone(),
            self.launcher.clone(),
            settings,
        ))
    }
}

async fn list_drives(settings: &Settings) -> Result<(), String> {
    let drives = DriveManager::new(platform_backend(), settings.drive_poll_interval());
    let found = drives.refresh().await;
    if let Availability::Broken(reason) = drives.availability() {
        return Err(format!("drive service unavailable: {}", reason));
    }
    if found.is_empty() {
        println!("No removable drives found");
    }
    for drive in found {
        let live = if drive.contains_live() { "  [live system]" } else { "" };
        println!("{:<40} {}{}", drive.id, drive.display_name(), live);
    }
    Ok(())
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

async fn load_catalog(source: &str) -> Result<Vec<Variant>, String> {
    if is_url(source) {
        catalog::fetch_catalog(source).await
    } else {
        catalog::load_catalog_file(Path::new(source))
    }
    .map_err(|e| e.to_string())
}

async fn list_variants(args: &VariantArgs) -> Result<(), String> {
    let variants = load_catalog(&args.catalog).await?;
    if args.boards {
        for board in catalog::get_unique_boards(&variants) {
            println!("{:<30} {:<30} {}", board.slug, board.name, board.variant_count);
        }
        return Ok(());
    }

    let channel = match args.channel.as_deref() {
        Some(name) => Some(Channel::parse(name).ok_or_else(|| format!("unknown channel: {}", name))?),
        None => None,
    };
    let filter = VariantFilter {
        arch: args.arch.as_deref().map(Architecture::parse),
        board: args.board.clone(),
        channel,
        ..VariantFilter::default()
    };
    for variant in catalog::filter_variants(&variants, &filter) {
        let writable = if variant.container.can_write() { "" } else { "  [not writable]" };
        println!(
            "{:<40} {:<10} {:<8} {:>10}{}",
            variant.id,
            variant.arch.name(),
            format!("{:?}", variant.channel).to_lowercase(),
            format_size(variant.size),
            writable
        );
    }
    Ok(())
}

/// Local file, URL, or catalog entry
async fn resolve_variant(args: &ImageArgs) -> Result<Variant, String> {
    let mut variant = if let Some(source) = &args.catalog {
        load_catalog(source)
            .await?
            .into_iter()
            .find(|v| v.id == args.image)
            .ok_or_else(|| format!("variant {} is not in the catalog", args.image))?
    } else if is_url(&args.image) {
        remote_variant(&args.image)?
    } else {
        Variant::local(Path::new(&args.image))?
    };

    if let Some(checksum) = &args.checksum {
        variant.checksum = Some(Checksum::parse(checksum)?);
    }
    log_info!(MODULE, "Selected {}", variant.display_name());
    Ok(variant)
}

fn remote_variant(url: &str) -> Result<Variant, String> {
    let name = file_name_from_url(url).ok_or_else(|| format!("no file name in {}", url))?;
    let container = ContainerType::from_file_name(name)
        .ok_or_else(|| format!("unknown image type: {}", name))?;
    Ok(Variant {
        id: url.to_string(),
        name: name.to_string(),
        version: String::new(),
        channel: Channel::Stable,
        arch: Architecture::Unknown,
        board: String::new(),
        source: VariantSource::Remote { url: url.to_string() },
        size: 0,
        image_size: None,
        checksum: None,
        container,
        live: false,
    })
}

fn status_label(status: VariantStatus) -> &'static str {
    match status {
        VariantStatus::Preparing => "Preparing",
        VariantStatus::Downloading => "Downloading",
        VariantStatus::CheckingDownload => "Checking download",
        VariantStatus::ReadyToWrite => "Ready to write",
        VariantStatus::Writing => "Writing",
        VariantStatus::CheckingWrittenData => "Verifying",
        VariantStatus::Finished => "Finished",
        VariantStatus::DownloadFailed => "Download failed",
        VariantStatus::WriteFailed => "Write failed",
    }
}

/// Drive `job` to completion with a progress bar; Ctrl-C cancels it
async fn with_progress<F>(orchestrator: &Orchestrator, job: F) -> Result<(), String>
where
    F: Future<Output = Result<(), OrchestratorError>>,
{
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{msg:18} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .map_err(|e| e.to_string())?
    .progress_chars("=> ");
    bar.set_style(style);
    bar.set_message(status_label(orchestrator.status()));

    let mut events = orchestrator.subscribe();
    let render = {
        let bar = bar.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(OrchestratorEvent::StatusChanged { to, .. }) => {
                        bar.set_message(status_label(to));
                        bar.set_position(0);
                    }
                    Ok(OrchestratorEvent::Progress { done, total }) => {
                        bar.set_length(total);
                        bar.set_position(done);
                    }
                    Ok(OrchestratorEvent::Phase(WritePhase::Flushing)) => bar.set_message("Flushing"),
                    Ok(OrchestratorEvent::Phase(_)) => {}
                    Ok(OrchestratorEvent::Resuming { offset, attempt }) => bar.println(format!(
                        "Connection lost, resuming at {} (attempt {})",
                        format_size(offset),
                        attempt
                    )),
                    Ok(OrchestratorEvent::Paused) => bar.set_message("Paused"),
                    Ok(OrchestratorEvent::Resumed) => bar.set_message("Downloading"),
                    Ok(OrchestratorEvent::WriteStopped { bytes_written }) => bar.println(format!(
                        "Stopped before writing finished, {} written",
                        format_size(bytes_written)
                    )),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };
    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log_info!(MODULE, "Interrupted, cancelling");
                orchestrator.cancel();
            }
        })
    };

    let result = job.await;
    interrupt.abort();
    render.abort();
    bar.finish_and_clear();

    result.map_err(|e| e.to_string())
}
