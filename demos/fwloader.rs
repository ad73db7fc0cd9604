/// fwloader.rs
///
/// Uploads firmware and bitstreams to a ZTEX board
///
/// Run with e.g.
///   cargo run --example fwloader -- --ram firmware.ihx --fpga fpga.bit
///   cargo run --example fwloader -- --bus-address 1-12 --nv firmware.img
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::BufReader;
use ztex::{BitSwap, Error, FirmwareImage, UsbZtex, ZtexBuilder};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Auto,
    Ls,
    Hs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Swap {
    Auto,
    On,
    Off,
}

impl From<Swap> for BitSwap {
    fn from(swap: Swap) -> Self {
        match swap {
            Swap::Auto => BitSwap::Auto,
            Swap::On => BitSwap::On,
            Swap::Off => BitSwap::Off,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Select the device by vendor and product ID, e.g. 04b4:8613
    #[arg(long, value_parser = parse_ids)]
    ids: Option<(u16, u16)>,

    /// Select the device by bus and address, e.g. 1-12
    #[arg(long, value_parser = parse_bus_address)]
    bus_address: Option<(u8, u8)>,

    /// Select the device by serial number
    #[arg(long)]
    serial: Option<String>,

    /// Upload firmware to RAM (.ihx or .img)
    #[arg(long)]
    ram: Option<String>,

    /// Upload firmware to non-volatile memory (EEPROM on FX2, Flash on FX3)
    #[arg(long)]
    nv: Option<String>,

    /// Disable the firmware in non-volatile memory
    #[arg(long)]
    disable_nv: bool,

    /// Configure the FPGA with a bitstream
    #[arg(long)]
    fpga: Option<String>,

    /// FPGA configuration method
    #[arg(long, value_enum, default_value_t = Mode::Auto)]
    mode: Mode,

    /// Store a bitstream in Flash for configuration at power-up
    #[arg(long)]
    flash_bitstream: Option<String>,

    /// Disable the bitstream stored in Flash
    #[arg(long)]
    reset_flash_bitstream: bool,

    /// Bit order of bitstreams
    #[arg(long, value_enum, default_value_t = Swap::Auto)]
    swap: Swap,

    /// Ignore compatibility checks and configure already configured FPGAs
    #[arg(short, long)]
    force: bool,
}

fn parse_ids(s: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = s.split_once(':').ok_or("expected VID:PID")?;
    let vid = u16::from_str_radix(vid, 16).map_err(|e| e.to_string())?;
    let pid = u16::from_str_radix(pid, 16).map_err(|e| e.to_string())?;
    Ok((vid, pid))
}

fn parse_bus_address(s: &str) -> Result<(u8, u8), String> {
    let (bus, address) = s.split_once('-').ok_or("expected BUS-ADDRESS")?;
    let bus = bus.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
    let address = address
        .parse()
        .map_err(|e: std::num::ParseIntError| e.to_string())?;
    Ok((bus, address))
}

fn open(args: &Args, allow_no_descriptor: bool) -> Result<UsbZtex, Error> {
    let mut builder = ZtexBuilder::new();
    builder.allow_no_descriptor(allow_no_descriptor);
    if let Some((vid, pid)) = args.ids {
        builder.ids(vid, pid);
    }
    if let Some((bus, address)) = args.bus_address {
        builder.bus_address(bus, address);
    }
    if let Some(serial) = &args.serial {
        builder.serial(serial);
    }
    builder.build()
}

fn execute(args: &Args) -> Result<(), Error> {
    let swap = BitSwap::from(args.swap);

    if let Some(path) = &args.ram {
        let image = FirmwareImage::from_file(path)?;
        let mut ztex = open(args, true)?;
        let duration = ztex.upload_ram(&image)?;
        println!("Firmware uploaded to RAM in {} ms", duration.as_millis());
        // The device renumerates and has to be opened again
        return Ok(());
    }

    let mut ztex = open(args, false)?;
    println!("{ztex}");

    if let Some(path) = &args.nv {
        let image = FirmwareImage::from_file(path)?;
        let duration = ztex.nv_upload_firmware(&image, args.force)?;
        println!(
            "Firmware uploaded to non-volatile memory in {} ms",
            duration.as_millis()
        );
    }

    if args.disable_nv {
        ztex.nv_disable_firmware()?;
        println!("Firmware in non-volatile memory disabled");
    }

    if let Some(path) = &args.fpga {
        let mut reader = BufReader::new(File::open(path)?);
        let mut fpga = ztex.fpga();
        let duration = match args.mode {
            Mode::Auto => fpga.upload_auto(&mut reader, args.force, swap)?,
            Mode::Ls => fpga.upload_ls(&mut reader, args.force, swap)?,
            Mode::Hs => fpga.upload_hs(&mut reader, args.force, swap)?,
        };
        println!("FPGA configured in {} ms", duration.as_millis());
    }

    if let Some(path) = &args.flash_bitstream {
        let mut reader = BufReader::new(File::open(path)?);
        let duration = ztex.flash_upload_bitstream(&mut reader, swap)?;
        println!("Bitstream stored in Flash in {} ms", duration.as_millis());
    }

    if args.reset_flash_bitstream {
        ztex.flash_reset_bitstream()?;
        println!("Bitstream in Flash disabled");
    }

    Ok(())
}

fn main() {
    env_logger::builder().init();

    let args = Args::parse();
    if let Err(e) = execute(&args) {
        error!("Error: {e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
