//! In-process stand-ins for hidraw, evdev, uinput and udev
//!
//! Reports and keystrokes travel through socket pairs so polling behaves like
//! it does on real device nodes. Unplugging shuts the device end down, which
//! polls as a hang-up.

use sidewinderd_common::{DevNode, DeviceDescriptor};
use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::device::{DeviceBackend, HotplugEvent, HotplugWatch};
use crate::error::{DriverError, DriverResult};
use crate::hid::HidTransport;
use crate::injector::{InjectResult, Injector};
use crate::input::{CapturedKey, KeyStream, KeyStreamOpener};
use crate::keyboard::{Keyboard, KeyboardSettings};

fn socket_pair() -> (UnixDatagram, UnixDatagram) {
    let (host, device) = UnixDatagram::pair().expect("socket pair");
    device.set_nonblocking(true).expect("nonblocking device end");
    (host, device)
}

fn no_such_device() -> DriverError {
    io::Error::from_raw_os_error(libc::ENODEV).into()
}

/// Control interface with in-memory feature reports
pub struct FakeHid {
    host: UnixDatagram,
    device: UnixDatagram,
    features: Mutex<HashMap<u8, u8>>,
    feature_writes: Mutex<Vec<Vec<u8>>>,
    output_writes: Mutex<Vec<Vec<u8>>>,
    unplugged: AtomicBool,
}

impl FakeHid {
    pub fn new() -> Arc<Self> {
        let (host, device) = socket_pair();
        Arc::new(Self {
            host,
            device,
            features: Mutex::new(HashMap::new()),
            feature_writes: Mutex::new(Vec::new()),
            output_writes: Mutex::new(Vec::new()),
            unplugged: AtomicBool::new(false),
        })
    }

    /// Current data byte of feature report `report_id`
    pub fn feature(&self, report_id: u8) -> u8 {
        self.features.lock().unwrap().get(&report_id).copied().unwrap_or(0)
    }

    /// Preset a feature report without logging a write
    pub fn set_feature(&self, report_id: u8, value: u8) {
        self.features.lock().unwrap().insert(report_id, value);
    }

    pub fn feature_writes(&self) -> Vec<Vec<u8>> {
        self.feature_writes.lock().unwrap().clone()
    }

    pub fn output_writes(&self) -> Vec<Vec<u8>> {
        self.output_writes.lock().unwrap().clone()
    }

    /// Queue an input report as if the keyboard sent it
    pub fn push_report(&self, report: &[u8]) {
        self.host.send(report).unwrap();
    }

    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::Relaxed);
        let _ = self.device.shutdown(Shutdown::Both);
    }

    fn check_plugged(&self) -> DriverResult<()> {
        if self.unplugged.load(Ordering::Relaxed) {
            return Err(no_such_device());
        }
        Ok(())
    }
}

impl HidTransport for FakeHid {
    fn get_feature_report(&self, report_id: u8) -> DriverResult<u8> {
        self.check_plugged()?;
        Ok(self.feature(report_id))
    }

    fn set_feature_report(&self, report_id: u8, value: u8) -> DriverResult<()> {
        self.send_feature_report(&[report_id, value])
    }

    fn send_feature_report(&self, data: &[u8]) -> DriverResult<()> {
        self.check_plugged()?;
        if let [report_id, value, ..] = data {
            self.set_feature(*report_id, *value);
        }
        self.feature_writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn write_data(&self, data: &[u8]) -> DriverResult<()> {
        self.check_plugged()?;
        self.output_writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn read_report(&self, buf: &mut [u8]) -> DriverResult<usize> {
        self.check_plugged()?;
        match self.device.recv(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

const KEY_RECORD_LEN: usize = 14;

/// Base of the timestamps handed out by [`FakeKeyInput::push_key`]
pub fn key_time(at_ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_millis(at_ms)
}

/// Input event node delivering queued keystrokes
pub struct FakeKeyInput {
    host: UnixDatagram,
    device: UnixDatagram,
    opened: AtomicUsize,
}

impl FakeKeyInput {
    pub fn new() -> Arc<Self> {
        let (host, device) = socket_pair();
        Arc::new(Self {
            host,
            device,
            opened: AtomicUsize::new(0),
        })
    }

    /// Queue a key event stamped `at_ms` after a fixed base time
    pub fn push_key(&self, code: u16, value: i32, at_ms: u64) {
        let mut record = [0u8; KEY_RECORD_LEN];
        record[..2].copy_from_slice(&code.to_le_bytes());
        record[2..6].copy_from_slice(&value.to_le_bytes());
        record[6..].copy_from_slice(&at_ms.to_le_bytes());
        self.host.send(&record).unwrap();
    }

    /// How many times the node has been opened
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn opener(self: &Arc<Self>) -> KeyStreamOpener {
        let input = self.clone();
        Arc::new(move |_path: &Path| -> DriverResult<Box<dyn KeyStream>> {
            input.opened.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FakeKeyStream {
                socket: input.device.try_clone()?,
            }))
        })
    }
}

struct FakeKeyStream {
    socket: UnixDatagram,
}

impl KeyStream for FakeKeyStream {
    fn fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    fn read_keys(&mut self) -> DriverResult<Vec<CapturedKey>> {
        let mut keys = Vec::new();
        let mut record = [0u8; KEY_RECORD_LEN];
        loop {
            match self.socket.recv(&mut record) {
                Ok(KEY_RECORD_LEN) => keys.push(CapturedKey {
                    code: u16::from_le_bytes([record[0], record[1]]),
                    value: i32::from_le_bytes([record[2], record[3], record[4], record[5]]),
                    time: key_time(u64::from_le_bytes([
                        record[6], record[7], record[8], record[9], record[10], record[11], record[12], record[13],
                    ])),
                }),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(keys),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Virtual keyboard that remembers every event written to it
#[derive(Default)]
pub struct RecordingInjector {
    events: Mutex<Vec<(u16, u16, i32)>>,
}

impl RecordingInjector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(u16, u16, i32)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Injector for RecordingInjector {
    async fn send_event(&self, type_: u16, code: u16, value: i32) -> InjectResult<()> {
        self.events.lock().unwrap().push((type_, code, value));
        Ok(())
    }
}

/// Hardware seen by a [`FakeBackend`]
#[derive(Default)]
struct Bus {
    present: HashSet<String>,
    failing: HashSet<String>,
    opened: HashMap<String, usize>,
    hids: HashMap<String, Arc<FakeHid>>,
    injectors: HashMap<String, Arc<RecordingInjector>>,
    inputs: HashMap<String, Arc<FakeKeyInput>>,
}

/// Device backend over fake keyboards, driven by the test
pub struct FakeBackend {
    bus: Mutex<Bus>,
    events: Mutex<Option<Sender<HotplugEvent>>>,
    watch: Mutex<Option<Receiver<HotplugEvent>>>,
    watch_fails: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        Arc::new(Self {
            bus: Mutex::new(Bus::default()),
            events: Mutex::new(Some(tx)),
            watch: Mutex::new(Some(rx)),
            watch_fails: AtomicBool::new(false),
        })
    }

    /// Attach the keyboard with `identity` ("vvvv:pppp")
    pub fn plug(&self, identity: &str) {
        self.bus.lock().unwrap().present.insert(identity.to_string());
    }

    /// Detach the keyboard and hang up its control interface
    pub fn unplug(&self, identity: &str) {
        let mut bus = self.bus.lock().unwrap();
        bus.present.remove(identity);
        if let Some(hid) = bus.hids.get(identity) {
            hid.unplug();
        }
    }

    /// Make opening `identity` fail
    pub fn fail_open(&self, identity: &str) {
        self.bus.lock().unwrap().failing.insert(identity.to_string());
    }

    pub fn fail_watch(&self) {
        self.watch_fails.store(true, Ordering::Relaxed);
    }

    pub fn notify(&self, event: HotplugEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// How many times `identity` was opened
    pub fn opened(&self, identity: &str) -> usize {
        self.bus.lock().unwrap().opened.get(identity).copied().unwrap_or(0)
    }

    /// Control interface of the last keyboard opened as `identity`
    pub fn hid(&self, identity: &str) -> Option<Arc<FakeHid>> {
        self.bus.lock().unwrap().hids.get(identity).cloned()
    }

    pub fn injector(&self, identity: &str) -> Option<Arc<RecordingInjector>> {
        self.bus.lock().unwrap().injectors.get(identity).cloned()
    }

    pub fn input(&self, identity: &str) -> Option<Arc<FakeKeyInput>> {
        self.bus.lock().unwrap().inputs.get(identity).cloned()
    }
}

impl DeviceBackend for FakeBackend {
    fn probe(&self, descriptor: &DeviceDescriptor) -> Option<DevNode> {
        let identity = descriptor.identity();
        if !self.bus.lock().unwrap().present.contains(&identity) {
            return None;
        }

        Some(DevNode {
            hidraw: Some(PathBuf::from(format!("/dev/fake/hidraw-{}", identity))),
            input_event: Some(PathBuf::from(format!("/dev/fake/event-{}", identity))),
        })
    }

    fn open_keyboard(
        &self,
        descriptor: &DeviceDescriptor,
        dev_node: DevNode,
        settings: KeyboardSettings,
        running: Arc<AtomicBool>,
    ) -> DriverResult<Keyboard> {
        let identity = descriptor.identity();
        let hid = FakeHid::new();
        let injector = RecordingInjector::new();
        let input = FakeKeyInput::new();

        {
            let mut bus = self.bus.lock().unwrap();
            if bus.failing.contains(&identity) {
                return Err(DriverError::Injector(format!("cannot open {}", identity)));
            }
            *bus.opened.entry(identity.clone()).or_insert(0) += 1;
            bus.hids.insert(identity.clone(), hid.clone());
            bus.injectors.insert(identity.clone(), injector.clone());
            bus.inputs.insert(identity, input.clone());
        }

        Ok(Keyboard::new(
            *descriptor,
            dev_node,
            hid,
            injector,
            input.opener(),
            settings,
            running,
        ))
    }

    fn watch(&self) -> DriverResult<Box<dyn HotplugWatch>> {
        if self.watch_fails.load(Ordering::Relaxed) {
            return Err(DriverError::Hotplug("no monitor socket".into()));
        }

        let rx = self
            .watch
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DriverError::Hotplug("watch already taken".into()))?;
        Ok(Box::new(FakeWatch { rx }))
    }
}

struct FakeWatch {
    rx: Receiver<HotplugEvent>,
}

impl HotplugWatch for FakeWatch {
    fn wait(&mut self, timeout_ms: u16) -> DriverResult<Option<HotplugEvent>> {
        match self.rx.recv_timeout(Duration::from_millis(timeout_ms as u64)) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::Hotplug("watch closed".into())),
        }
    }
}
