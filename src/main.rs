use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::ProgressBar;

use kitsprog::flashing::VerifyReport;
use kitsprog::format::ChecksumPolicy;
use kitsprog::transport::SerialTransport;
use kitsprog::{ChipDb, Flashing, HexImage};

#[derive(clap::Parser)]
#[clap(
    name = "kitsprog",
    about = "Command-line driver for Kitsrus PIC programmers (protocol P018)",
    author = "Brandon Fosdick <bfoz@bfoz.net>"
)]
struct Cli {
    /// Serial port of the programmer; the first available port is used
    /// when omitted
    #[clap(short, long, global = true)]
    port: Option<String>,

    /// Target device name, e.g. PIC16F628A
    #[clap(short, long, global = true)]
    chip: Option<String>,

    /// Use a chipinfo YAML file instead of the embedded database
    #[clap(long, global = true)]
    chipinfo: Option<String>,

    /// Reject hex files with bad record checksums instead of ignoring them
    #[clap(long, global = true)]
    strict: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Program a hex file into the chip (config, then EEPROM, then ROM)
    Program {
        /// The hex file to program
        path: String,
        /// Erase the chip before programming
        #[clap(long)]
        erase: bool,
        /// Skip the verify pass after programming
        #[clap(long)]
        no_verify: bool,
    },
    /// Read the chip into a hex file
    Read {
        path: String,
    },
    /// Compare the chip contents against a hex file
    Verify {
        path: String,
    },
    /// Bulk-erase the chip
    Erase {},
    /// Check for a chip in the socket
    Detect {},
    /// List the chips in the database
    Chips {},
    /// List the available serial ports
    Ports {},
}

fn main() -> Result<()> {
    let _ = simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let cli = Cli::parse();
    let checksums = if cli.strict {
        ChecksumPolicy::Verify
    } else {
        ChecksumPolicy::Ignore
    };

    match &cli.command {
        Commands::Program {
            path,
            erase,
            no_verify,
        } => {
            let mut image = HexImage::load(path, checksums)?;
            log::info!("Loaded {} ({} words)", path, image.len());
            let mut flashing = establish(&cli)?;
            flashing.program_all(&mut image, *erase)?;
            if !no_verify {
                report_verify(flashing.verify(&image)?)?;
            }
            log::info!("Done");
        }
        Commands::Read { path } => {
            let mut flashing = establish(&cli)?;
            let mut image = flashing.read_all()?;
            image.save(path)?;
            log::info!("Wrote {} ({} words)", path, image.len());
        }
        Commands::Verify { path } => {
            let image = HexImage::load(path, checksums)?;
            let mut flashing = establish(&cli)?;
            report_verify(flashing.verify(&image)?)?;
        }
        Commands::Erase {} => {
            let mut flashing = establish(&cli)?;
            flashing.bulk_erase()?;
            log::info!("Erased");
        }
        Commands::Detect {} => {
            let mut flashing = establish(&cli)?;
            if flashing.detect_chip()? {
                log::info!("Chip detected in socket");
            } else {
                log::warn!("No chip in socket");
                exit(1);
            }
        }
        Commands::Chips {} => {
            for name in load_db(&cli)?.names() {
                println!("{}", name);
            }
        }
        Commands::Ports {} => {
            for port in SerialTransport::scan_ports()? {
                println!("{}", port);
            }
        }
    }

    Ok(())
}

fn load_db(cli: &Cli) -> Result<ChipDb> {
    match &cli.chipinfo {
        Some(path) => ChipDb::from_file(path),
        None => ChipDb::load(),
    }
}

fn establish(cli: &Cli) -> Result<Flashing<SerialTransport>> {
    let chip = cli
        .chip
        .as_deref()
        .context("select a target device with --chip (see `kitsprog chips`)")?;
    let profile = load_db(cli)?.find(chip)?;

    let transport = match &cli.port {
        Some(port) => SerialTransport::open(port)?,
        None => SerialTransport::open_any()?,
    };

    let mut flashing = Flashing::establish(transport, profile)?;
    flashing.dump_info()?;
    flashing.set_progress(progress_bar());
    Ok(flashing)
}

/// One bar per transfer phase; a fresh one appears whenever the previous
/// phase completed.
fn progress_bar() -> impl FnMut(usize, usize) -> bool + 'static {
    let mut bar: Option<ProgressBar> = None;
    move |at, total| {
        let b = bar.get_or_insert_with(|| ProgressBar::new(total as u64));
        if b.length() != Some(total as u64) {
            b.set_length(total as u64);
        }
        b.set_position(at as u64);
        if at >= total {
            if let Some(done) = bar.take() {
                done.finish_and_clear();
            }
        }
        true
    }
}

fn report_verify(report: VerifyReport) -> Result<()> {
    log::info!("Flash:  {}", if report.rom { "Pass" } else { "Fail" });
    log::info!("EEPROM: {}", if report.eeprom { "Pass" } else { "Fail" });
    log::info!("Config: Not verified");
    anyhow::ensure!(report.passed(), "verification failed");
    Ok(())
}
