//! Sidewinderd daemon library
//!
//! Drives the extra keys of supported gaming keyboards:
//! - device discovery and hot-plug through udev
//! - vendor report decoding and LED control over hidraw
//! - macro recording from evdev and playback through uinput

pub mod config;
pub mod device;
pub mod error;
pub mod hid;
pub mod injector;
pub mod input;
pub mod keyboard;
pub mod led;
pub mod macro_engine;
pub mod vendor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use device::{DeviceBackend, DeviceManager, UdevBackend, SUPPORTED_DEVICES};
pub use error::{DriverError, DriverResult};
pub use keyboard::{Keyboard, KeyboardSettings};
pub use sidewinderd_common::{DeviceDescriptor, DriverVariant, KeyEvent, KeyKind, MacroEvent, MacroLog};
