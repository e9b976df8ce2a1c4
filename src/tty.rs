use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::BridgeError;
use crate::serial::{PortFilter, PortInfo, PortOptions, PortPicker, PortWriter, SerialPort};

const DEVICE_PREFIXES: [&str; 2] = ["ttyUSB", "ttyACM"];

/// Serial devices found under `/dev`, plus an explicitly configured one.
pub struct DevicePicker {
    dev_dir: PathBuf,
    sys_dir: PathBuf,
    configured: Option<PathBuf>,
}

impl DevicePicker {
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sys_dir: PathBuf::from("/sys/class/tty"),
            configured,
        }
    }

    /// Scan other directories. Used by tests.
    pub fn with_dirs(dev_dir: PathBuf, sys_dir: PathBuf, configured: Option<PathBuf>) -> Self {
        Self {
            dev_dir,
            sys_dir,
            configured,
        }
    }

    fn scan(&self) -> Vec<DevicePort> {
        let mut ports = Vec::new();
        if let Some(path) = &self.configured {
            ports.push(DevicePort::new(path.clone(), self.usb_ids(path)));
        }

        let entries = match fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Cannot list {}: {}", self.dev_dir.display(), e);
                return ports;
            }
        };

        let mut found: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| DEVICE_PREFIXES.iter().any(|p| n.starts_with(p)))
            })
            .filter(|path| Some(path) != self.configured.as_ref())
            .collect();
        found.sort();

        for path in found {
            let ids = self.usb_ids(&path);
            ports.push(DevicePort::new(path, ids));
        }
        ports
    }

    /// USB vendor and product ids, read from sysfs when the device has them.
    ///
    /// CDC ACM devices link `device` to the USB interface, so the ids sit one
    /// level up. USB serial converters (FTDI, CH340) link it to the port below
    /// the interface, so the ids sit two levels up.
    fn usb_ids(&self, path: &Path) -> (Option<u16>, Option<u16>) {
        let Some(name) = path.file_name() else {
            return (None, None);
        };
        let device = self.sys_dir.join(name).join("device");
        let read_id = |dir: &Path, file: &str| {
            fs::read_to_string(dir.join(file))
                .ok()
                .and_then(|raw| u16::from_str_radix(raw.trim(), 16).ok())
        };

        for usb_dir in [device.join(".."), device.join("..").join("..")] {
            let vendor = read_id(&usb_dir, "idVendor");
            if vendor.is_some() {
                return (vendor, read_id(&usb_dir, "idProduct"));
            }
        }
        (None, None)
    }
}

#[async_trait]
impl PortPicker for DevicePicker {
    async fn request_port(&self, filters: &[PortFilter]) -> Result<Box<dyn SerialPort>, BridgeError> {
        let port = self
            .scan()
            .into_iter()
            .find(|port| filters.is_empty() || filters.iter().any(|f| f.matches(&port.info())))
            .ok_or(BridgeError::PortUnavailable)?;
        log::info!("Picked serial device {}", port.path.display());
        Ok(Box::new(port))
    }

    async fn known_ports(&self) -> Result<Vec<Box<dyn SerialPort>>, BridgeError> {
        Ok(self
            .scan()
            .into_iter()
            .map(|port| Box::new(port) as Box<dyn SerialPort>)
            .collect())
    }
}

/// A character device (or any writable file) used as the serial sink.
pub struct DevicePort {
    path: PathBuf,
    usb_vendor_id: Option<u16>,
    usb_product_id: Option<u16>,
}

impl DevicePort {
    pub fn new(path: PathBuf, (usb_vendor_id, usb_product_id): (Option<u16>, Option<u16>)) -> Self {
        Self {
            path,
            usb_vendor_id,
            usb_product_id,
        }
    }
}

#[async_trait]
impl SerialPort for DevicePort {
    fn info(&self) -> PortInfo {
        PortInfo {
            name: self.path.display().to_string(),
            usb_vendor_id: self.usb_vendor_id,
            usb_product_id: self.usb_product_id,
        }
    }

    async fn open(&mut self, options: &PortOptions) -> io::Result<PortWriter> {
        let path = self.path.clone();
        let baud_rate = options.baud_rate;
        let file = tokio::task::spawn_blocking(move || -> io::Result<fs::File> {
            let file = fs::OpenOptions::new().write(true).open(&path)?;
            configure(&file, baud_rate)?;
            Ok(file)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

/// Raw mode at the requested speed. Files that are not terminals (pipes,
/// plain files, sockets) are used as they are.
#[cfg(unix)]
fn configure(file: &fs::File, baud_rate: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::termios::{self, SetArg};

    let mut attrs = match termios::tcgetattr(file) {
        Ok(attrs) => attrs,
        Err(Errno::ENOTTY) | Err(Errno::EINVAL) => {
            log::debug!("Serial sink is not a terminal, skipping line setup");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    termios::cfmakeraw(&mut attrs);
    termios::cfsetspeed(&mut attrs, baud(baud_rate)?)?;
    termios::tcsetattr(file, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

#[cfg(not(unix))]
fn configure(_file: &fs::File, _baud_rate: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn baud(rate: u32) -> io::Result<nix::sys::termios::BaudRate> {
    use nix::sys::termios::BaudRate;

    Ok(match rate {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {}", other),
            ))
        }
    })
}
