use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{Context, Result};

mod disk;
mod error;
mod fdcemu;
mod kh940;
mod nibble;
mod orchestrator;
mod util;

use disk::Disk;
use fdcemu::{configure_serial_port, FdcServer};
use kh940::Pattern;
pub use nibble::Nibble;

#[derive(Subcommand)]
enum Command {
    /// Emulate being a floppy drive on a USB->FTDI port
    Emulate { port: PathBuf, disk: PathBuf },

    /// Extract images from a disk image into a folder
    Export { disk: PathBuf, target: PathBuf },

    /// Import images from a folder into a disk image ready for emulation
    Import { disk: PathBuf, source: PathBuf },
}

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Command::Emulate { port, disk } => {
            let mut port =
                serial::open(&port).context(format!("Could not open serial port at {port:?}"))?;
            configure_serial_port(&mut port)?;

            let mut fdc_server = FdcServer::new(&disk, port)?;
            fdc_server.run()?;
        }
        Command::Export {
            disk: disk_path,
            target,
        } => {
            let mut disk = Disk::new();
            disk.load(&disk_path)
                .context(format!("Could not read disk data from {disk_path:?}"))?;
            let machine_state = orchestrator::disk_to_state(&disk)
                .context("Could not parse machine state from disk")?;

            if !target.exists() {
                std::fs::create_dir_all(&target)
                    .context(format!("Could not create target folder at {target:?}"))?;
            }

            for pattern in machine_state.patterns() {
                let image = pattern.to_image();
                image.save(target.join(format!("{}.png", pattern.pattern_number())))?;
            }
        }
        Command::Import {
            disk: disk_path,
            source,
        } => {
            let mut disk = Disk::new();
            disk.load(&disk_path)
                .context(format!("Could not read disk data from {disk_path:?}"))?;
            let mut machine_state = orchestrator::disk_to_state(&disk)
                .context("Could not parse machine state from disk")?;

            for entry in source
                .read_dir()
                .context(format!("Could not read source folder at {source:?}"))?
            {
                let entry = entry?;

                let path = entry.path();
                let pattern_number = path
                    .file_stem()
                    .and_then(|f| f.to_str())
                    .and_then(|f| f.parse::<u16>().ok());
                let extension = path.extension().and_then(|f| f.to_str());
                if let (Some(pattern_number), Some("png")) = (pattern_number, extension) {
                    let image =
                        image::open(&path).context(format!("Could not read file at {path:?}"))?;
                    let grayscale = image::imageops::grayscale(&image);

                    let pattern = Pattern::from_image(pattern_number, &grayscale)
                        .context(format!("Could not read file at {path:?}"))?;
                    machine_state
                        .add_pattern(pattern)
                        .context(format!("Could not add pattern from {path:?}"))?;
                }
            }

            orchestrator::state_to_disk(&mut machine_state, &mut disk);
            disk.save(&disk_path)?;
        }
    }

    Ok(())
}
