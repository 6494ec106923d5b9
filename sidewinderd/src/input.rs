use sidewinderd_common::tracing;
use evdev::{Device as EvdevDevice, InputEventKind};
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

use crate::error::DriverResult;

/// Key event read from the plain keyboard interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedKey {
    pub code: u16,
    /// 0 release, 1 press, 2 autorepeat
    pub value: i32,
    pub time: SystemTime,
}

/// Stream of key events from the plain keyboard interface, read while recording
pub trait KeyStream: Send {
    fn fd(&self) -> BorrowedFd<'_>;

    /// Drain the pending key events. Non-key events are dropped.
    fn read_keys(&mut self) -> DriverResult<Vec<CapturedKey>>;
}

/// Opens the input event node of a keyboard on demand
pub type KeyStreamOpener = Arc<dyn Fn(&Path) -> DriverResult<Box<dyn KeyStream>> + Send + Sync>;

pub struct EvdevKeyStream {
    device: EvdevDevice,
}

impl EvdevKeyStream {
    pub fn open(path: &Path) -> DriverResult<Self> {
        let device = EvdevDevice::open(path)?;
        info!(
            "Opened input node {} ({})",
            path.display(),
            device.name().unwrap_or("unnamed")
        );
        Ok(Self { device })
    }

    pub fn opener() -> KeyStreamOpener {
        Arc::new(|path: &Path| -> DriverResult<Box<dyn KeyStream>> {
            Ok(Box::new(EvdevKeyStream::open(path)?))
        })
    }
}

impl KeyStream for EvdevKeyStream {
    fn fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor is owned by `self.device` and outlives the borrow
        unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) }
    }

    fn read_keys(&mut self) -> DriverResult<Vec<CapturedKey>> {
        match self.device.fetch_events() {
            Ok(events) => Ok(events
                .filter_map(|event| match event.kind() {
                    InputEventKind::Key(key) => Some(CapturedKey {
                        code: key.code(),
                        value: event.value(),
                        time: event.timestamp(),
                    }),
                    _ => None,
                })
                .collect()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
