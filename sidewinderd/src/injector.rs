use sidewinderd_common::{tracing, DeviceDescriptor};
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, info, warn};

use crate::error::{DriverError, DriverResult};

// Linux input event constants
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
const SYN_REPORT: u16 = 0x00;
const KEY_CODE_MAX: u16 = 0x2ff;

// uinput ioctl constants
const UI_SET_EVBIT: u64 = 0x40045564;   // _IOW('U', 100, int)
const UI_SET_KEYBIT: u64 = 0x40045565;  // _IOW('U', 101, int)
const UI_DEV_CREATE: u64 = 0x5501;      // _IO('U', 1)
const UI_DEV_DESTROY: u64 = 0x5502;     // _IO('U', 2)

const VIRTUAL_DEVICE_NAME: &[u8] = b"Sidewinderd";

pub type InjectResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Linux input_event structure
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct InputEvent {
    time: libc::timeval,
    type_: u16,
    code: u16,
    value: i32,
}

/// uinput_user_dev structure for device setup
#[repr(C)]
struct UinputUserDev {
    name: [u8; 80],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; 64],
    absmin: [i32; 64],
    absfuzz: [i32; 64],
    absflat: [i32; 64],
}

#[repr(C)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

/// Sink for synthesized input events
#[async_trait::async_trait]
pub trait Injector: Send + Sync {
    /// Emit one event followed by a sync report
    async fn send_event(&self, type_: u16, code: u16, value: i32) -> InjectResult<()>;

    async fn key_press(&self, key_code: u16) -> InjectResult<()> {
        self.send_event(EV_KEY, key_code, 1).await
    }

    async fn key_release(&self, key_code: u16) -> InjectResult<()> {
        self.send_event(EV_KEY, key_code, 0).await
    }
}

/// Virtual keyboard created through uinput, one per bound keyboard
pub struct UinputInjector {
    file: File,
}

impl UinputInjector {
    /// Create the virtual device, carrying the ids of the physical keyboard
    pub fn create(descriptor: &DeviceDescriptor) -> DriverResult<Self> {
        info!("Creating uinput virtual device for {}", descriptor);

        let file = OpenOptions::new()
            .write(true)
            .open("/dev/uinput")
            .map_err(|e| {
                error!("Failed to open /dev/uinput: {}. Ensure you have root privileges and uinput module is loaded.", e);
                e
            })?;

        let fd = file.as_raw_fd();

        unsafe {
            if libc::ioctl(fd, UI_SET_EVBIT, EV_KEY as libc::c_int) < 0 {
                return Err(DriverError::Injector("failed to set EV_KEY bit".into()));
            }

            if libc::ioctl(fd, UI_SET_EVBIT, EV_SYN as libc::c_int) < 0 {
                return Err(DriverError::Injector("failed to set EV_SYN bit".into()));
            }

            // recorded macros may contain any key code
            for key in 0..=KEY_CODE_MAX {
                if libc::ioctl(fd, UI_SET_KEYBIT, key as libc::c_int) < 0 {
                    warn!("Failed to set keybit for key {}", key);
                }
            }
        }

        let mut dev: UinputUserDev = unsafe { mem::zeroed() };
        dev.name[..VIRTUAL_DEVICE_NAME.len()].copy_from_slice(VIRTUAL_DEVICE_NAME);
        dev.id.bustype = 0x03; // BUS_USB
        dev.id.vendor = descriptor.vendor_id;
        dev.id.product = descriptor.product_id;
        dev.id.version = 1;

        unsafe {
            let dev_ptr = &dev as *const UinputUserDev as *const u8;
            let dev_slice = std::slice::from_raw_parts(dev_ptr, mem::size_of::<UinputUserDev>());

            if libc::write(fd, dev_slice.as_ptr() as *const libc::c_void, dev_slice.len()) < 0 {
                return Err(DriverError::Injector(format!(
                    "failed to write uinput device structure: {}",
                    std::io::Error::last_os_error()
                )));
            }

            if libc::ioctl(fd, UI_DEV_CREATE) < 0 {
                return Err(DriverError::Injector(format!(
                    "failed to create uinput device: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }

        info!("Created uinput virtual device {:04x}:{:04x}", descriptor.vendor_id, descriptor.product_id);
        Ok(Self { file })
    }

    /// Write an input event to the uinput device
    fn write_event(&self, type_: u16, code: u16, value: i32) -> InjectResult<()> {
        let mut event: InputEvent = unsafe { mem::zeroed() };

        unsafe {
            libc::gettimeofday(&mut event.time, std::ptr::null_mut());
        }

        event.type_ = type_;
        event.code = code;
        event.value = value;

        unsafe {
            let event_ptr = &event as *const InputEvent as *const u8;
            let event_slice = std::slice::from_raw_parts(event_ptr, mem::size_of::<InputEvent>());

            let written = libc::write(self.file.as_raw_fd(), event_slice.as_ptr() as *const libc::c_void, event_slice.len());
            if written < 0 {
                return Err(format!("Failed to write event: {}", std::io::Error::last_os_error()).into());
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Injector for UinputInjector {
    async fn send_event(&self, type_: u16, code: u16, value: i32) -> InjectResult<()> {
        debug!("Inject type={} code={} value={}", type_, code, value);
        self.write_event(type_, code, value)?;
        self.write_event(EV_SYN, SYN_REPORT, 0)
    }
}

impl Drop for UinputInjector {
    fn drop(&mut self) {
        info!("Destroying uinput virtual device");
        unsafe {
            libc::ioctl(self.file.as_raw_fd(), UI_DEV_DESTROY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingInjector;

    #[test]
    fn test_input_event_layout() {
        assert_eq!(mem::size_of::<InputEvent>(), mem::size_of::<libc::timeval>() + 8);
        assert_eq!(&VIRTUAL_DEVICE_NAME[..], b"Sidewinderd");
    }

    #[tokio::test]
    async fn test_default_key_helpers() {
        let injector = RecordingInjector::new();
        injector.key_press(30).await.unwrap();
        injector.key_release(30).await.unwrap();

        assert_eq!(injector.events(), vec![(EV_KEY, 30, 1), (EV_KEY, 30, 0)]);
    }

    // Creating a real device requires root privileges and /dev/uinput access
}
