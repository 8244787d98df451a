//! mediamon CLI - Command line interface for removable media handling.
//!
//! Inspects disc images, looks up mounts, classifies directories and drives
//! the mount state machine of a single device.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mediamon_core::device::detect_media_type_in;
use mediamon_core::{
    DeviceKind, DeviceSpec, MediaConfig, MediaContext, MediaDevice, inspect_image,
};
use tracing_subscriber::EnvFilter;

/// mediamon CLI tool.
#[derive(Parser)]
#[command(name = "mediamon")]
#[command(about = "Removable media detection and mounting", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/mediamon/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Treat unconfigured devices as optical drives instead of disks.
    #[arg(long, global = true)]
    optical: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the type of a disc image (Bluray, DVD or Unknown).
    Inspect { path: String },

    /// Print the mount point of a device.
    FindMount { device: String },

    /// Classify the files in a directory by extension.
    Detect { dir: PathBuf },

    /// Mount a device and classify its content.
    Mount { device: String },

    /// Unmount a device.
    Unmount { device: String },

    /// Probe a device and print its status.
    Status { device: String },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> MediaConfig {
    let result = match path {
        Some(path) => MediaConfig::load(path),
        None => MediaConfig::load_default(),
    };
    result.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        process::exit(1);
    })
}

/// Builds the device for `path`, using its config entry if there is one.
fn open_device(config: &MediaConfig, path: &str, optical: bool) -> MediaDevice {
    let ctx = match config.build_context() {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let spec = config
        .devices
        .iter()
        .find(|spec| spec.path == path)
        .cloned()
        .unwrap_or_else(|| {
            let kind = if optical {
                DeviceKind::Optical
            } else {
                DeviceKind::Disk
            };
            DeviceSpec::new(path, kind)
        });

    MediaDevice::with_kind(
        ctx,
        spec.kind,
        spec.path,
        spec.supermount,
        spec.allow_eject,
    )
}

fn print_state(device: &MediaDevice) {
    println!("status: {}", device.status());
    println!("media:  {}", device.media_type());
    if let Some(mount) = device.mount_path() {
        println!("mount:  {}", mount.display());
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Inspect { path } => {
            println!("{}", inspect_image(&path));
        }
        Commands::FindMount { device } => {
            let config = load_config(cli.config.as_deref());
            let mut device = open_device(&config, &device, cli.optical);
            if !device.find_mount_path() {
                eprintln!("{} is not mounted", device.device_path());
                process::exit(1);
            }
            if let Some(mount) = device.mount_path() {
                println!("{}", mount.display());
            }
        }
        Commands::Detect { dir } => {
            let config = load_config(cli.config.as_deref());
            let registry = config.build_registry().unwrap_or_else(|e| {
                eprintln!("Error: {}", e);
                process::exit(1);
            });
            println!("{}", detect_media_type_in(&registry, &dir));
        }
        Commands::Mount { device } => {
            let config = load_config(cli.config.as_deref());
            let mut device = open_device(&config, &device, cli.optical);
            let ok = device.mount();
            print_state(&device);
            if !ok {
                process::exit(1);
            }
        }
        Commands::Unmount { device } => {
            let config = load_config(cli.config.as_deref());
            let mut device = open_device(&config, &device, cli.optical);
            device.check_media();
            let ok = device.unmount();
            print_state(&device);
            if !ok {
                process::exit(1);
            }
        }
        Commands::Status { device } => {
            let config = load_config(cli.config.as_deref());
            let mut device = open_device(&config, &device, cli.optical);
            println!("{}", device.check_media());
        }
    }
}
