//! Constants used in the ZTEX host-side protocol implementation
use rusb::constants::LIBUSB_ENDPOINT_IN;
use std::time::Duration;

/// ZTEX device identity

/// ZTEX USB vendor ID
pub const ZTEX_VID: u16 = 0x221a;
/// Lowest USB product ID assigned to ZTEX firmware
pub const ZTEX_PID_MIN: u16 = 0x0100;
/// Highest USB product ID assigned to ZTEX firmware
pub const ZTEX_PID_MAX: u16 = 0x01ff;
/// Cypress vendor ID, used by unprogrammed EZ-USB devices
pub const CYPRESS_VID: u16 = 0x04b4;
/// Interface version this crate speaks
pub const INTERFACE_VERSION: u8 = 1;

/// ZTEX descriptor layout

/// Size of the ZTEX descriptor
pub const ZTEX_DESCRIPTOR_SIZE: usize = 40;
/// Version of the ZTEX descriptor
pub const ZTEX_DESCRIPTOR_VERSION: u8 = 1;
/// Signature embedded in the ZTEX descriptor
pub const ZTEX_DESCRIPTOR_SIGNATURE: &[u8; 4] = b"ZTEX";
/// Number of interface capability bytes carried by the ZTEX descriptor
pub const CAPABILITY_BYTES: usize = 6;

/// Vendor requests (device to host) and vendor commands (host to device)

/// Read the ZTEX descriptor
pub const VR_ZTEX_DESCRIPTOR: u8 = 0x22;
/// Read the debug ring buffer (v1) or an indexed log message (v2)
pub const VR_DEBUG: u8 = 0x28;
/// Read USB 3 error counters
pub const VR_USB3_ERRORS: u8 = 0x29;
/// Read the FPGA state
pub const VR_FPGA_STATE: u8 = 0x30;
/// Reset the FPGA
pub const VC_FPGA_RESET: u8 = 0x31;
/// Send bitstream data via control transfers
pub const VC_FPGA_SEND: u8 = 0x32;
/// Read high speed FPGA configuration endpoint and interface
pub const VR_FPGA_HS_INFO: u8 = 0x33;
/// Start high speed FPGA configuration
pub const VC_FPGA_HS_START: u8 = 0x34;
/// Finish high speed FPGA configuration
pub const VC_FPGA_HS_FINISH: u8 = 0x35;
/// Read from the EEPROM
pub const VR_EEPROM_READ: u8 = 0x38;
/// Write to the EEPROM
pub const VC_EEPROM_WRITE: u8 = 0x39;
/// Read the EEPROM state
pub const VR_EEPROM_STATE: u8 = 0x3a;
/// Read from the MAC EEPROM
pub const VR_MAC_EEPROM_READ: u8 = 0x3b;
/// Write to the MAC EEPROM
pub const VC_MAC_EEPROM_WRITE: u8 = 0x3c;
/// Read the MAC EEPROM state
pub const VR_MAC_EEPROM_STATE: u8 = 0x3d;
/// Read the Flash state
pub const VR_FLASH_STATE: u8 = 0x40;
/// Read Flash sectors
pub const VR_FLASH_READ: u8 = 0x41;
/// Write Flash sectors
pub const VC_FLASH_WRITE: u8 = 0x42;
/// Read the Flash controller (SPI/SD) diagnostic state
pub const VR_FLASH_INFO: u8 = 0x43;
/// Read the 2nd Flash state
pub const VR_FLASH2_STATE: u8 = 0x44;
/// Read 2nd Flash sectors
pub const VR_FLASH2_READ: u8 = 0x45;
/// Write 2nd Flash sectors
pub const VC_FLASH2_WRITE: u8 = 0x46;
/// Read the 2nd Flash controller diagnostic state
pub const VR_FLASH2_INFO: u8 = 0x47;
/// Read the XMEGA state
pub const VR_XMEGA_STATE: u8 = 0x48;
/// Reset the XMEGA
pub const VC_XMEGA_RESET: u8 = 0x49;
/// Read XMEGA NVM
pub const VR_XMEGA_NVM_READ: u8 = 0x4a;
/// Read XMEGA Flash (request) / write an XMEGA Flash page (command)
pub const XMEGA_FLASH: u8 = 0x4b;
/// Read XMEGA EEPROM (request) / write an XMEGA EEPROM page (command)
pub const XMEGA_EEPROM: u8 = 0x4c;
/// Read (request) / write (command) an XMEGA fuse
pub const XMEGA_FUSE: u8 = 0x4d;
/// Read multi FPGA information
pub const VR_MULTI_FPGA_INFO: u8 = 0x50;
/// Select an FPGA
pub const VC_MULTI_FPGA_SELECT: u8 = 0x51;
/// Read the temperature sensor
pub const VR_TEMP_SENSOR: u8 = 0x58;
/// Default interface: reset signal
pub const VC_DEFAULT_RESET: u8 = 0x60;
/// Default interface: set/get GPIOs
pub const VR_DEFAULT_GPIO: u8 = 0x61;
/// Default interface: write low speed interface registers
pub const VC_DEFAULT_LSI_SET: u8 = 0x62;
/// Default interface: read low speed interface registers
pub const VR_DEFAULT_LSI_GET: u8 = 0x63;
/// Default interface: version and endpoints
pub const VR_DEFAULT_INFO: u8 = 0x64;
/// EZ-USB anchor load (RAM write), handled by the chip's boot ROM
pub const VC_ANCHOR_LOAD: u8 = 0xa0;
/// FX2 CPU control and status register
pub const FX2_CPUCS: u16 = 0xe600;

/// Timeouts

/// Used for ordinary vendor requests and commands
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
/// Used for Flash sector writes
pub const DEFAULT_FLASH_WRITE_TIMEOUT: Duration = Duration::from_millis(3000);
/// Used for the first sub-transfers of a large Flash sector write, which may erase
pub const DEFAULT_FLASH_ERASE_TIMEOUT: Duration = Duration::from_millis(12000);
/// Used for high speed bitstream bulk transfers
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Interval between busy polls of the Flash state
pub const FLASH_BUSY_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Settle time after EEPROM accesses
pub const EEPROM_SETTLE: Duration = Duration::from_millis(10);
/// Settle time after XMEGA accesses
pub const XMEGA_SETTLE: Duration = Duration::from_millis(3);
/// Settle time after a low speed FPGA configuration
pub const FPGA_LS_SETTLE: Duration = Duration::from_millis(100);
/// Settle time after a high speed FPGA configuration
pub const FPGA_HS_SETTLE: Duration = Duration::from_millis(25);
/// Minimum interval between two temperature sensor reads
pub const TEMP_SENSOR_MIN_INTERVAL: Duration = Duration::from_millis(40);
/// Default interval between two temperature sensor reads
pub const TEMP_SENSOR_DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
/// Wait before starting an FX3 image loaded into RAM
pub const FX3_RAM_START_DELAY: Duration = Duration::from_secs(1);

/// Retry bounds

/// Flash state polls while the device reports busy
pub const FLASH_BUSY_TRIES: u32 = 20;
/// Attempts of a complete low speed FPGA configuration
pub const FPGA_LS_TRIES: u32 = 10;
/// Attempts of a complete high speed FPGA configuration
pub const FPGA_HS_TRIES: u32 = 3;
/// Attempts per EEPROM/XMEGA page write-and-verify
pub const PAGE_WRITE_TRIES: u32 = 3;

/// Transfer sizes

/// Largest control transfer used for Flash sector data
pub const FLASH_TRANSFER_MAX: usize = 2048;
/// Chunk size of a low speed FPGA configuration
pub const FPGA_LS_TRANSACTION_SIZE: usize = 2048;
/// Chunk size of a high speed FPGA configuration
pub const FPGA_HS_TRANSACTION_SIZE: usize = 65536;
/// Zero bytes prefixed to a high speed bitstream
pub const FPGA_HS_DUMMY_HEADER: usize = 512;
/// EEPROM writes must not cross this boundary
pub const EEPROM_WRITE_BOUNDARY: u16 = 64;
/// Largest anchor load transfer
pub const ANCHOR_LOAD_MAX: usize = 4096;

/// Flash sub-transfer markers (index field of a large sector transfer)

/// First sub-transfer of a sector
pub const FLASH_INDEX_FIRST: u16 = 0;
/// Middle sub-transfer of a sector
pub const FLASH_INDEX_MIDDLE: u16 = 256;
/// Last sub-transfer of a sector
pub const FLASH_INDEX_LAST: u16 = 512;

/// Miscellaneous protocol values

/// INIT_B history reported after a clean configuration
pub const INIT_B_CLEAN: u8 = 222;
/// MAC EEPROM offsets below this are protected while a configuration record is attached
pub const CONFIG_PROTECTED_SIZE: u16 = 80;
/// Offset of the MAC address in the MAC EEPROM
pub const MAC_ADDRESS_OFFSET: u16 = 250;
/// Latest default interface version
pub const DEFAULT_LATEST_VERSION: u8 = 1;
/// Latest default interface sub-version
pub const DEFAULT_LATEST_SUB_VERSION: u8 = 4;
/// Bit set on the default interface's in endpoint
pub const ENDPOINT_IN: u8 = LIBUSB_ENDPOINT_IN;
/// Maximum number of low speed interface registers per transfer
pub const LSI_MAX_REGISTERS: usize = 256;
