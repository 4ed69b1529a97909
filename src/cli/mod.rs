//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use with the
//! [flashwriter] command-line application, and are likely not of much use
//! otherwise.
//!
//! No stability guarantees apply.
//!
//! [flashwriter]: https://crates.io/crates/flashwriter

use std::path::PathBuf;

use clap::Args;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, LevelFilter};
use miette::{miette, IntoDiagnostic, Result, WrapErr};

use self::{config::Config, serial::get_serial_port};
use crate::{
    config::{CompressMode, WriteRequest},
    controller::SessionController,
    events::{Event, EventSink},
    flasher::{stubs::FlashStub, FlashFrequency, FlashMode, FlashSize, WriteOutcome},
    targets::Chip,
    transport::SerialTransport,
};

pub mod config;

mod serial;

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "FLASHWRITER_PORT")]
    pub port: Option<String>,
    /// Baud rate at which to communicate with the device after connecting
    #[arg(short = 'b', long, env = "FLASHWRITER_BAUD")]
    pub baud: Option<u32>,
    /// Target device
    #[arg(short = 'c', long, value_enum, default_value_t = Chip::Esp32)]
    pub chip: Chip,
    /// Path to the flasher stub program (TOML)
    #[arg(long)]
    pub stub: Option<PathBuf>,
}

/// Configure the flash header of bootloader images
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashConfigArgs {
    /// Flash frequency
    #[arg(short = 'f', long, value_name = "FREQ", value_enum)]
    pub flash_freq: Option<FlashFrequency>,
    /// Flash mode to use
    #[arg(short = 'm', long, value_name = "MODE", value_enum)]
    pub flash_mode: Option<FlashMode>,
    /// Flash size of the target, detected when not given
    #[arg(short = 's', long, value_name = "SIZE", value_enum)]
    pub flash_size: Option<FlashSize>,
}

/// Write images to the flash of a device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct WriteFlashArgs {
    /// Pairs of hexadecimal offset and image file, e.g. `0x1000 bootloader.bin`
    #[arg(value_name = "OFFSET FILE", required_unless_present = "erase_all")]
    pub images: Vec<String>,
    /// Erase the whole flash before writing
    #[arg(long)]
    pub erase_all: bool,
    /// Compare the digest of every image once more after writing
    #[arg(long)]
    pub verify: bool,
    /// Compress images before sending them
    #[arg(long, value_enum, default_value_t = CompressMode::Auto)]
    pub compress: CompressMode,
    /// Leave the device in the bootloader after writing
    #[arg(long)]
    pub no_reset: bool,

    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    #[clap(flatten)]
    pub flash_config_args: FlashConfigArgs,
}

/// Initialize the logger with the given default level
///
/// The level can be overridden with `RUST_LOG`.
pub fn initialize_logger(filter: LevelFilter) {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(filter.to_string().to_lowercase()),
    )
    .format_target(false)
    .init();
}

/// Connect to a device and print what it is
pub fn board_info(args: &ConnectArgs, config: &Config) -> Result<()> {
    let controller = open_controller(args, config)?;
    let mut progress = ProgressSink::new();

    let identity = controller.connect(&mut progress)?;
    println!("{identity}");

    Ok(())
}

/// Write the given images to the device, as configured on the command line
/// and in the configuration file
pub fn write_flash(args: WriteFlashArgs, config: &Config) -> Result<()> {
    let request = write_request(&args, config)?;
    let session = request.into_config()?;

    let controller = SessionController::new(Box::new(SerialTransport::new(session.port.clone())));
    let handle = controller.spawn_write(session)?;

    let cancel = handle.cancel_token();
    ctrlc::set_handler(move || cancel.cancel())
        .into_diagnostic()
        .wrap_err("Failed to install the Ctrl-C handler")?;

    let mut progress = ProgressSink::new();
    for event in handle.events().iter() {
        progress.emit(event);
    }

    match handle.wait()? {
        WriteOutcome::Completed { written } => {
            debug!("{written} images written");
            if !args.no_reset {
                println!("Hard resetting via RTS pin...");
                controller.hard_reset()?;
            }
            println!("\nFlashing has completed!");
        }
        WriteOutcome::Cancelled { completed, total } => {
            println!("\nFlashing was cancelled ({completed} of {total} images written)");
        }
    }

    Ok(())
}

/// Erase the whole flash of the device
pub fn erase_flash(args: &ConnectArgs, config: &Config) -> Result<()> {
    let stub = load_stub(args, config)?.ok_or_else(|| {
        miette!(
            help = "Pass `--stub` or set `stub` in flashwriter.toml",
            "Erasing the flash requires the flasher stub"
        )
    })?;

    let controller = open_controller(args, config)?;
    let mut progress = ProgressSink::new();
    controller.erase_flash(Some(&stub), &mut progress)?;
    println!("Flash has been erased!");

    Ok(())
}

/// Connect to the device, then reset it into its application
pub fn reset(args: &ConnectArgs, config: &Config) -> Result<()> {
    let controller = open_controller(args, config)?;
    let mut progress = ProgressSink::new();

    controller.connect(&mut progress)?;
    println!("Hard resetting via RTS pin...");
    controller.hard_reset()?;

    Ok(())
}

fn open_controller(args: &ConnectArgs, config: &Config) -> Result<SessionController> {
    let port = get_serial_port(args, config)?;

    Ok(SessionController::new(Box::new(SerialTransport::new(port))))
}

fn load_stub(args: &ConnectArgs, config: &Config) -> Result<Option<FlashStub>> {
    let stub = args
        .stub
        .as_deref()
        .or(config.stub.as_deref())
        .map(FlashStub::load)
        .transpose()?;

    Ok(stub)
}

/// Merge the command-line arguments with the configuration file
fn write_request(args: &WriteFlashArgs, config: &Config) -> Result<WriteRequest> {
    if args.images.len() % 2 != 0 {
        return Err(miette!(
            help = "Images are given as pairs, e.g. `0x1000 bootloader.bin 0x10000 app.bin`",
            "Missing the file for offset {}",
            args.images.last().map(String::as_str).unwrap_or_default()
        ));
    }

    let images = args
        .images
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), PathBuf::from(&pair[1])))
        .collect();

    let connect = &args.connect_args;
    let flash = &args.flash_config_args;

    Ok(WriteRequest {
        chip: connect.chip,
        port: get_serial_port(connect, config)?,
        baud: connect.baud.or(config.connection.baud),
        images,
        erase_all: args.erase_all,
        verify: args.verify,
        compress: args.compress,
        flash_mode: flash.flash_mode.or(config.flash.mode),
        flash_freq: flash.flash_freq.or(config.flash.freq),
        flash_size: flash.flash_size.or(config.flash.size),
        stub: connect.stub.clone().or_else(|| config.stub.clone()),
    })
}

/// Renders session events on the terminal, with a progress bar per image
pub struct ProgressSink {
    bars: MultiProgress,
    current: Option<ProgressBar>,
}

impl ProgressSink {
    pub fn new() -> Self {
        ProgressSink {
            bars: MultiProgress::new(),
            current: None,
        }
    }

    fn println(&self, message: String) {
        self.bars.suspend(|| println!("{message}"));
    }
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for ProgressSink {
    fn emit(&mut self, event: Event) {
        match event {
            Event::PairStarted {
                index,
                total,
                address,
                ref name,
                ..
            } => {
                let bar = self.bars.add(ProgressBar::new(100));
                bar.set_style(
                    ProgressStyle::with_template(
                        "[{elapsed_precise}] [{bar:40}] {pos:>3}% {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
                );
                bar.set_message(format!("{}/{} {name} @ {address:#x}", index + 1, total));
                self.current = Some(bar);
            }
            Event::WritingBlock { percent, .. } => {
                if let Some(bar) = &self.current {
                    bar.set_position(percent as u64);
                }
            }
            Event::PairComplete { .. } => {
                if let Some(bar) = self.current.take() {
                    bar.finish();
                }
                self.println(event.to_string());
            }
            Event::Connected(ref identity) => {
                self.println(event.to_string());
                debug!("{identity:?}");
            }
            Event::Cancelled { .. } | Event::Failed(_) | Event::ConnectFailed { .. } => {
                if let Some(bar) = self.current.take() {
                    bar.abandon();
                }
                self.println(event.to_string());
            }
            event => self.println(event.to_string()),
        }
    }
}
