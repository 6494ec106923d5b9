//! Raw HID access through hidraw
//!
//! `HidChannel` is a thin wrapper around one opened hidraw node. It carries no
//! policy: LED logic lives in [`crate::led`], report decoding in
//! [`crate::vendor`].

use sidewinderd_common::tracing;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, info};

use crate::error::DriverResult;

// HIDIOCGFEATURE(len) / HIDIOCSFEATURE(len)
nix::ioctl_readwrite_buf!(hidiocgfeature, b'H', 0x07, u8);
nix::ioctl_readwrite_buf!(hidiocsfeature, b'H', 0x06, u8);

/// Operations a keyboard needs from its control interface
pub trait HidTransport: Send + Sync {
    /// Read the single data byte of feature report `report_id`
    fn get_feature_report(&self, report_id: u8) -> DriverResult<u8>;

    /// Write the single data byte of feature report `report_id`
    fn set_feature_report(&self, report_id: u8, value: u8) -> DriverResult<()>;

    /// Send a full feature report; `data[0]` is the report id
    fn send_feature_report(&self, data: &[u8]) -> DriverResult<()>;

    /// Raw output report write
    fn write_data(&self, data: &[u8]) -> DriverResult<()>;

    /// Read one input report. Returns 0 when nothing is pending.
    fn read_report(&self, buf: &mut [u8]) -> DriverResult<usize>;

    /// Descriptor to wait on for input reports
    fn fd(&self) -> BorrowedFd<'_>;
}

/// An opened hidraw node
pub struct HidChannel {
    file: File,
}

impl HidChannel {
    pub fn open(path: &Path) -> DriverResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        info!("Opened hidraw node {} (fd={})", path.display(), file.as_raw_fd());
        Ok(Self { file })
    }
}

impl HidTransport for HidChannel {
    fn get_feature_report(&self, report_id: u8) -> DriverResult<u8> {
        let mut buf = [report_id, 0];
        unsafe {
            hidiocgfeature(self.file.as_raw_fd(), &mut buf)?;
        }
        Ok(buf[1])
    }

    fn set_feature_report(&self, report_id: u8, value: u8) -> DriverResult<()> {
        self.send_feature_report(&[report_id, value])
    }

    fn send_feature_report(&self, data: &[u8]) -> DriverResult<()> {
        // the ioctl takes a mutable buffer even for SET
        let mut buf = data.to_vec();
        unsafe {
            hidiocsfeature(self.file.as_raw_fd(), &mut buf)?;
        }
        debug!("Feature report {:02x?}", data);
        Ok(())
    }

    fn write_data(&self, data: &[u8]) -> DriverResult<()> {
        (&self.file).write_all(data)?;
        debug!("Output report {:02x?}", data);
        Ok(())
    }

    fn read_report(&self, buf: &mut [u8]) -> DriverResult<usize> {
        match (&self.file).read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
