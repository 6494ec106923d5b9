use sidewinderd_common::{tracing, DevNode, DeviceDescriptor, DriverVariant};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DriverError, DriverResult};
use crate::hid::{HidChannel, HidTransport};
use crate::injector::{Injector, UinputInjector};
use crate::input::EvdevKeyStream;
use crate::keyboard::{Keyboard, KeyboardSettings};

/// Upper bound of one wait for a hot-plug notification
pub const HOTPLUG_TIMEOUT_MS: u16 = 1000;

/// The plain keyboard interface of every supported model
const INPUT_INTERFACE: &str = "00";

pub static SUPPORTED_DEVICES: &[DeviceDescriptor] = &[
    DeviceDescriptor {
        vendor_id: 0x045e,
        product_id: 0x074b,
        display_name: "Microsoft SideWinder X6",
        variant: DriverVariant::SideWinder,
        control_interface: 1,
    },
    DeviceDescriptor {
        vendor_id: 0x045e,
        product_id: 0x0768,
        display_name: "Microsoft SideWinder X4",
        variant: DriverVariant::SideWinder,
        control_interface: 1,
    },
    DeviceDescriptor {
        vendor_id: 0x046d,
        product_id: 0xc248,
        display_name: "Logitech G105",
        variant: DriverVariant::LogitechG105,
        control_interface: 1,
    },
    DeviceDescriptor {
        vendor_id: 0x046d,
        product_id: 0xc24d,
        display_name: "Logitech G710/G710+",
        variant: DriverVariant::LogitechG710,
        control_interface: 1,
    },
    DeviceDescriptor {
        vendor_id: 0x046d,
        product_id: 0xc33f,
        display_name: "Logitech G815",
        variant: DriverVariant::LogitechG815,
        control_interface: 1,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Add,
    Remove,
}

/// Source of device add/remove notifications. Lives on the monitoring thread.
pub trait HotplugWatch {
    /// Wait up to `timeout_ms` for the next notification
    fn wait(&mut self, timeout_ms: u16) -> DriverResult<Option<HotplugEvent>>;
}

/// How devices are found and opened
pub trait DeviceBackend: Send + Sync {
    /// Locate the control and input nodes of `descriptor`. Both must be found.
    fn probe(&self, descriptor: &DeviceDescriptor) -> Option<DevNode>;

    fn open_keyboard(
        &self,
        descriptor: &DeviceDescriptor,
        dev_node: DevNode,
        settings: KeyboardSettings,
        running: Arc<AtomicBool>,
    ) -> DriverResult<Keyboard>;

    fn watch(&self) -> DriverResult<Box<dyn HotplugWatch>>;
}

/// udev enumeration, hidraw, evdev and uinput
pub struct UdevBackend;

impl UdevBackend {
    fn scan_nodes(descriptor: &DeviceDescriptor) -> DriverResult<DevNode> {
        let vendor = format!("{:04x}", descriptor.vendor_id);
        let product = format!("{:04x}", descriptor.product_id);
        let interface = format!("{:02x}", descriptor.control_interface);

        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("hidraw")?;
        enumerator.match_subsystem("input")?;

        let mut node = DevNode::default();
        for device in enumerator.scan_devices()? {
            match device.subsystem().and_then(OsStr::to_str) {
                Some("hidraw") if node.hidraw.is_none() => {
                    if is_control_interface(&device, &vendor, &product, &interface)? {
                        node.hidraw = device.devnode().map(Path::to_path_buf);
                    }
                }
                Some("input") if node.input_event.is_none() => {
                    if is_keyboard_event_node(&device, &vendor, &product)? {
                        node.input_event = device.devnode().map(Path::to_path_buf);
                    }
                }
                _ => {}
            }
        }

        Ok(node)
    }
}

fn attribute<'a>(device: &'a udev::Device, name: &str) -> Option<&'a str> {
    device.attribute_value(name).and_then(OsStr::to_str)
}

fn property<'a>(device: &'a udev::Device, name: &str) -> Option<&'a str> {
    device.property_value(name).and_then(OsStr::to_str)
}

/// hidraw node on the vendor control interface of the keyboard
fn is_control_interface(device: &udev::Device, vendor: &str, product: &str, interface: &str) -> DriverResult<bool> {
    let Some(usb_interface) = device.parent_with_subsystem_devtype("usb", "usb_interface")? else {
        debug!("No USB interface above {}", device.syspath().display());
        return Ok(false);
    };

    if attribute(&usb_interface, "bInterfaceNumber") != Some(interface) {
        return Ok(false);
    }

    let Some(usb_device) = usb_interface.parent_with_subsystem_devtype("usb", "usb_device")? else {
        return Ok(false);
    };

    Ok(attribute(&usb_device, "idVendor") == Some(vendor) && attribute(&usb_device, "idProduct") == Some(product))
}

/// event node of the plain keyboard interface
fn is_keyboard_event_node(device: &udev::Device, vendor: &str, product: &str) -> DriverResult<bool> {
    let is_event = device
        .syspath()
        .file_name()
        .and_then(OsStr::to_str)
        .map_or(false, |name| name.starts_with("event"));

    if !is_event
        || property(device, "ID_VENDOR_ID") != Some(vendor)
        || property(device, "ID_MODEL_ID") != Some(product)
        || property(device, "ID_USB_INTERFACE_NUM") != Some(INPUT_INTERFACE)
        || property(device, "ID_INPUT_KEYBOARD").is_none()
    {
        return Ok(false);
    }

    Ok(device.parent_with_subsystem("usb")?.is_some())
}

impl DeviceBackend for UdevBackend {
    fn probe(&self, descriptor: &DeviceDescriptor) -> Option<DevNode> {
        match Self::scan_nodes(descriptor) {
            Ok(node) if node.is_complete() => {
                info!("Found device: {}", descriptor);
                Some(node)
            }
            Ok(node) => {
                if node.hidraw.is_some() {
                    warn!("{} has no keyboard input node, not binding", descriptor);
                }
                None
            }
            Err(e) => {
                warn!("Probing {} failed: {}", descriptor, e);
                None
            }
        }
    }

    fn open_keyboard(
        &self,
        descriptor: &DeviceDescriptor,
        dev_node: DevNode,
        settings: KeyboardSettings,
        running: Arc<AtomicBool>,
    ) -> DriverResult<Keyboard> {
        let hidraw = dev_node.hidraw.as_deref().ok_or_else(|| DriverError::MissingNode {
            device: descriptor.to_string(),
            node: "hidraw",
        })?;

        let hid: Arc<dyn HidTransport> = Arc::new(HidChannel::open(hidraw)?);
        let injector: Arc<dyn Injector> = Arc::new(UinputInjector::create(descriptor)?);

        Ok(Keyboard::new(
            *descriptor,
            dev_node,
            hid,
            injector,
            EvdevKeyStream::opener(),
            settings,
            running,
        ))
    }

    fn watch(&self) -> DriverResult<Box<dyn HotplugWatch>> {
        let socket = udev::MonitorBuilder::new()
            .and_then(|builder| builder.match_subsystem("hidraw"))
            // the event node may settle after the hidraw nodes
            .and_then(|builder| builder.match_subsystem("input"))
            .and_then(|builder| builder.listen())
            .map_err(|e| DriverError::Hotplug(e.to_string()))?;

        Ok(Box::new(UdevWatch { socket }))
    }
}

struct UdevWatch {
    socket: udev::MonitorSocket,
}

impl HotplugWatch for UdevWatch {
    fn wait(&mut self, timeout_ms: u16) -> DriverResult<Option<HotplugEvent>> {
        let ready = {
            // SAFETY: the socket owns the descriptor for the whole poll
            let fd = unsafe { BorrowedFd::borrow_raw(self.socket.as_raw_fd()) };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(e) => return Err(e.into()),
            }
        };

        if !ready {
            return Ok(None);
        }

        Ok(self.socket.iter().next().and_then(|event| {
            debug!("udev {:?} {}", event.event_type(), event.syspath().display());
            match event.event_type() {
                udev::EventType::Add => Some(HotplugEvent::Add),
                udev::EventType::Remove => Some(HotplugEvent::Remove),
                _ => None,
            }
        }))
    }
}

/// A bound keyboard as seen by the manager
struct Binding {
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Reconciles the supported-device table against attached hardware
///
/// Only the manager adds or removes registry entries. Keyboard tasks report
/// back solely through their liveness flag.
pub struct DeviceManager {
    backend: Arc<dyn DeviceBackend>,
    supported: Vec<DeviceDescriptor>,
    settings: KeyboardSettings,
    running: Arc<AtomicBool>,
    connected: HashMap<String, Binding>,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn DeviceBackend>, settings: KeyboardSettings, running: Arc<AtomicBool>) -> Self {
        Self {
            backend,
            supported: SUPPORTED_DEVICES.to_vec(),
            settings,
            running,
            connected: HashMap::new(),
        }
    }

    /// Replace the supported-device table
    pub fn with_supported(mut self, supported: Vec<DeviceDescriptor>) -> Self {
        self.supported = supported;
        self
    }

    pub fn probe(&self, descriptor: &DeviceDescriptor) -> Option<DevNode> {
        self.backend.probe(descriptor)
    }

    /// Bind every supported keyboard that is present and not bound yet.
    /// Returns the number of newly bound keyboards.
    pub fn discover(&mut self) -> usize {
        let mut bound = 0;

        for descriptor in self.supported.clone() {
            let identity = descriptor.identity();

            if let Some(binding) = self.connected.get(&identity) {
                if binding.connected.load(Ordering::Relaxed) {
                    continue;
                }
                // unplugged and back before the sweep saw it
                debug!("Dropping stale binding of {}", descriptor);
                self.connected.remove(&identity);
            }

            let Some(dev_node) = self.probe(&descriptor) else {
                continue;
            };

            match self
                .backend
                .open_keyboard(&descriptor, dev_node, self.settings.clone(), self.running.clone())
            {
                Ok(keyboard) => {
                    self.bind(identity, keyboard);
                    bound += 1;
                }
                Err(e) => warn!("Failed to open {}: {}", descriptor, e),
            }
        }

        if bound > 0 {
            info!("Bound {} keyboard(s), {} connected", bound, self.connected.len());
        }
        bound
    }

    fn bind(&mut self, identity: String, keyboard: Keyboard) {
        let connected = keyboard.connection();
        connected.store(true, Ordering::Relaxed);
        info!("Binding {} as {}", keyboard.descriptor(), identity);

        let task = tokio::task::spawn_blocking(move || keyboard.run());
        self.connected.insert(identity, Binding { connected, task });
    }

    /// Drop every keyboard that reported itself disconnected
    pub fn unbind(&mut self) -> usize {
        let before = self.connected.len();
        self.connected.retain(|identity, binding| {
            let alive = binding.connected.load(Ordering::Relaxed);
            if !alive {
                info!("Unbinding {}", identity);
            }
            alive
        });
        before - self.connected.len()
    }

    /// Watch for hot-plug events until the running flag clears
    pub fn monitor(&mut self) -> DriverResult<()> {
        let mut watch = self.backend.watch().map_err(|e| {
            error!("Cannot watch for devices: {}", e);
            e
        })?;

        self.discover();

        let mut result = Ok(());
        while self.running.load(Ordering::Relaxed) {
            match watch.wait(HOTPLUG_TIMEOUT_MS) {
                Ok(Some(HotplugEvent::Add)) => {
                    self.discover();
                }
                Ok(Some(HotplugEvent::Remove)) | Ok(None) => {
                    self.unbind();
                }
                Err(e) => {
                    error!("Hot-plug watch failed: {}", e);
                    result = Err(e);
                    break;
                }
            }
        }

        let tasks = self.shutdown();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            for task in tasks {
                if let Err(e) = runtime.block_on(task) {
                    warn!("Keyboard task ended abnormally: {}", e);
                }
            }
        }

        result
    }

    /// Disconnect every bound keyboard and clear the registry. Returns the
    /// listen tasks so callers can wait for them.
    pub fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        if !self.connected.is_empty() {
            info!("Releasing {} keyboard(s)", self.connected.len());
        }

        self.connected
            .drain()
            .map(|(_, binding)| {
                binding.connected.store(false, Ordering::Relaxed);
                binding.task
            })
            .collect()
    }

    /// Identities of the bound keyboards, sorted
    pub fn connected(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.connected.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Liveness flag of a bound keyboard
    pub fn connection(&self, identity: &str) -> Option<Arc<AtomicBool>> {
        self.connected.get(identity).map(|binding| binding.connected.clone())
    }
}
