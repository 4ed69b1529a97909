use clap::{Parser, Subcommand};
use flashwriter::cli::{
    board_info, config::Config, erase_flash, initialize_logger, reset, write_flash,
    ConnectArgs, WriteFlashArgs,
};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    /// Default log level, overridden by `RUST_LOG`
    #[arg(long, global = true, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print information about the connected board
    BoardInfo(ConnectArgs),
    /// Write one or more images to flash
    ///
    /// Images are given as pairs of hexadecimal offset and file, for example
    /// `flashwriter write-flash 0x1000 bootloader.bin 0x8000 partitions.bin
    /// 0x10000 app.bin`.
    WriteFlash(WriteFlashArgs),
    /// Erase the whole flash (requires the flasher stub)
    EraseFlash(ConnectArgs),
    /// Reset the device into its application
    Reset(ConnectArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let cli = Cli::parse();
    initialize_logger(cli.log_level);
    debug!("{:#?}", cli.subcommand);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match cli.subcommand {
        Commands::BoardInfo(args) => board_info(&args, &config),
        Commands::WriteFlash(args) => write_flash(args, &config),
        Commands::EraseFlash(args) => erase_flash(&args, &config),
        Commands::Reset(args) => reset(&args, &config),
    }
}
