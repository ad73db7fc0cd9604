//! Prints information about the first ZTEX board found: the ZTEX
//! descriptor, the capabilities, FPGA state, Flash usage and the default
//! interface version.
//!
//! All logging is done to stderr and can be controlled via the `RUST_LOG`
//! environment variable.
use ztex::{Capability, Error, UsbZtex, ZtexBuilder};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

fn print_info(ztex: &mut UsbZtex) -> Result<(), Error> {
    println!("{ztex}");
    ztex.info().print();

    if ztex.supports(Capability::Fpga) {
        let state = ztex.fpga().state()?;
        println!(
            "  - {}: {state}",
            if state.configured {
                "FPGA configured"
            } else {
                "FPGA unconfigured"
            }
        );
        if ztex.supports(Capability::MultiFpga) {
            println!("  - FPGAs: {}", ztex.fpga().number_of_fpgas()?);
        }
    }

    let flash = ztex.flash_info();
    if !flash.is_empty() {
        println!("  - Flash: {flash}");
    }
    let flash2 = ztex.flash2_info();
    if !flash2.is_empty() {
        println!("  - 2nd Flash: {flash2}");
    }

    if let Some(cd) = ztex.config_data() {
        println!("  - board: {}  serial: {}", cd.name(), cd.serial);
    }
    if ztex.supports(Capability::MacEeprom) {
        let mac = ztex.mac_eeprom().mac_address()?;
        let mac: Vec<String> = mac.iter().map(|b| format!("{b:02X}")).collect();
        println!("  - MAC address: {}", mac.join(":"));
    }

    let version = ztex.default_interface().version()?;
    if version > 0 {
        let sub_version = ztex.default_interface().sub_version()?;
        println!("  - default interface: {version}.{sub_version}");
    }

    if ztex.supports(Capability::TempSensor) {
        let temps: Result<Vec<String>, Error> = (0..4)
            .map(|i| -> Result<String, Error> {
                Ok(format!("{:.1}", ztex.temp_sensor_read(i)?))
            })
            .collect();
        println!("  - temperatures (°C): {}", temps?.join(" "));
    }

    Ok(())
}

fn execute() -> Result<(), Error> {
    info!("Opening ZTEX device");
    let mut ztex = ZtexBuilder::new().build()?;
    print_info(&mut ztex)
}

fn main() {
    env_logger::builder().init();

    match execute() {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            error!("Error: {e}");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
