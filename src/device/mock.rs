//! Scripted in-memory [`Device`] used by unit tests.
//!
//! Vendor requests and commands are answered by per-code handler closures,
//! and every transfer is recorded so that tests can check the wire traffic.
use super::{Device, DeviceInfo, ZtexDescriptor};
use crate::capability::{Capability, CapabilityTable};
use crate::Error;

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Once;
use std::time::Duration;

pub(crate) type RequestHandler = Box<dyn FnMut(u16, u16, &mut [u8]) -> Result<usize, Error>>;
pub(crate) type CommandHandler = Box<dyn FnMut(u16, u16, &[u8]) -> Result<usize, Error>>;
pub(crate) type BulkHandler = Box<dyn FnMut(u8, &[u8]) -> Result<usize, Error>>;

/// One recorded transfer
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Transfer {
    In {
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        timeout: Duration,
    },
    Out {
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
        timeout: Duration,
    },
    Bulk {
        endpoint: u8,
        length: usize,
    },
}

impl Transfer {
    pub(crate) fn request(&self) -> Option<u8> {
        match self {
            Transfer::In { request, .. } | Transfer::Out { request, .. } => Some(*request),
            Transfer::Bulk { .. } => None,
        }
    }
}

pub(crate) struct MockDevice {
    info: DeviceInfo,
    requests: HashMap<u8, RequestHandler>,
    commands: HashMap<u8, CommandHandler>,
    bulk: Option<BulkHandler>,
    claimed: BTreeSet<u8>,
    deny_claims: bool,
    pub(crate) transfers: Vec<Transfer>,
    pub(crate) delays: Vec<Duration>,
    pub(crate) claims: Vec<u8>,
    pub(crate) releases: Vec<u8>,
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDevice")
            .field("info", &self.info)
            .field("transfers", &self.transfers.len())
            .finish()
    }
}

impl MockDevice {
    /// A device running interface version 1 firmware with the given
    /// capabilities
    pub(crate) fn new(capabilities: &[Capability]) -> Self {
        let table = CapabilityTable::with(capabilities);
        let mut caps = [0u8; 6];
        caps.copy_from_slice(&table.as_bytes()[..6]);
        let descriptor = ZtexDescriptor {
            product_id: [10, 30, 0, 0],
            fw_version: 1,
            interface_version: 1,
            capabilities: caps,
            module_reserved: [0; 12],
            serial: "0000000001".to_string(),
        };
        Self::with_info(DeviceInfo {
            vendor_id: 0x221a,
            product_id: 0x0100,
            descriptor: Some(descriptor),
            ..Default::default()
        })
    }

    pub(crate) fn with_info(info: DeviceInfo) -> Self {
        Self {
            info,
            requests: HashMap::new(),
            commands: HashMap::new(),
            bulk: None,
            claimed: BTreeSet::new(),
            deny_claims: false,
            transfers: vec![],
            delays: vec![],
            claims: vec![],
            releases: vec![],
        }
    }

    pub(crate) fn on_request(
        &mut self,
        request: u8,
        handler: impl FnMut(u16, u16, &mut [u8]) -> Result<usize, Error> + 'static,
    ) -> &mut Self {
        self.requests.insert(request, Box::new(handler));
        self
    }

    /// Answers `request` with a fixed reply, truncated to the buffer length
    pub(crate) fn on_request_reply(&mut self, request: u8, reply: Vec<u8>) -> &mut Self {
        self.on_request(request, move |_, _, buf| {
            let n = reply.len().min(buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            Ok(n)
        })
    }

    pub(crate) fn on_command(
        &mut self,
        request: u8,
        handler: impl FnMut(u16, u16, &[u8]) -> Result<usize, Error> + 'static,
    ) -> &mut Self {
        self.commands.insert(request, Box::new(handler));
        self
    }

    /// Accepts `request` and ignores its data
    pub(crate) fn accept_command(&mut self, request: u8) -> &mut Self {
        self.on_command(request, |_, _, data| Ok(data.len()))
    }

    pub(crate) fn on_bulk(
        &mut self,
        handler: impl FnMut(u8, &[u8]) -> Result<usize, Error> + 'static,
    ) -> &mut Self {
        self.bulk = Some(Box::new(handler));
        self
    }

    /// Marks `iface` as already claimed by someone else on this handle
    pub(crate) fn preclaim(&mut self, iface: u8) -> &mut Self {
        self.claimed.insert(iface);
        self
    }

    /// Fails every interface claim with an access error, as libusb does
    /// when another driver holds the interface
    pub(crate) fn deny_claims(&mut self) -> &mut Self {
        self.deny_claims = true;
        self
    }

    pub(crate) fn count(&self, request: u8) -> usize {
        self.transfers
            .iter()
            .filter(|t| t.request() == Some(request))
            .count()
    }

    pub(crate) fn commands(&self, request: u8) -> Vec<&Transfer> {
        self.transfers
            .iter()
            .filter(|t| matches!(t, Transfer::Out { request: r, .. } if *r == request))
            .collect()
    }
}

impl Device for MockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.transfers.push(Transfer::In {
            request,
            value,
            index,
            length: buffer.len(),
            timeout,
        });
        match self.requests.get_mut(&request) {
            Some(handler) => handler(value, index, buffer),
            None => Err(Error::usb(format!("Pipe error (no handler for 0x{request:02x})"))),
        }
    }

    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buffer: &[u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.transfers.push(Transfer::Out {
            request,
            value,
            index,
            data: buffer.to_vec(),
            timeout,
        });
        match self.commands.get_mut(&request) {
            Some(handler) => handler(value, index, buffer),
            None => Err(Error::usb(format!("Pipe error (no handler for 0x{request:02x})"))),
        }
    }

    fn write_bulk(
        &mut self,
        endpoint: u8,
        buffer: &[u8],
        _timeout: Duration,
    ) -> Result<usize, Error> {
        self.transfers.push(Transfer::Bulk {
            endpoint,
            length: buffer.len(),
        });
        match self.bulk.as_mut() {
            Some(handler) => handler(endpoint, buffer),
            None => Err(Error::usb("Pipe error (no bulk handler)")),
        }
    }

    fn read_bulk(
        &mut self,
        _endpoint: u8,
        _buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, Error> {
        Err(Error::usb("Pipe error (bulk reads are not scripted)"))
    }

    fn claim_interface(&mut self, iface: u8) -> Result<(), Error> {
        if self.deny_claims {
            return Err(rusb::Error::Access.into());
        }
        self.claims.push(iface);
        self.claimed.insert(iface);
        Ok(())
    }

    fn release_interface(&mut self, iface: u8) -> Result<(), Error> {
        self.releases.push(iface);
        self.claimed.remove(&iface);
        Ok(())
    }

    fn is_claimed(&self, iface: u8) -> bool {
        self.claimed.contains(&iface)
    }

    fn delay(&mut self, dur: Duration) {
        self.delays.push(dur);
    }
}

thread_local! {
    static RECORDS: RefCell<Vec<(Level, String)>> = RefCell::new(Vec::new());
}

/// Collects log records per thread, so that parallel tests only see their
/// own records
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        RECORDS.with(|r| {
            r.borrow_mut()
                .push((record.level(), record.args().to_string()))
        });
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// Starts capturing the log records of the calling test
pub(crate) fn capture_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
    RECORDS.with(|r| r.borrow_mut().clear());
}

/// Messages logged at `level` since [`capture_logs`]
pub(crate) fn logged(level: Level) -> Vec<String> {
    RECORDS.with(|r| {
        r.borrow()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, msg)| msg.clone())
            .collect()
    })
}
