use std::fmt;
use std::path::{Path, PathBuf};

// Re-export common dependencies
pub use tracing;

pub mod macro_doc;

pub use macro_doc::{load_macro, save_macro, MacroError, MacroResult};

/// Number of profiles every supported keyboard exposes
pub const MAX_PROFILE: u8 = 3;

/// Which keyboard driver handles a supported device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverVariant {
    SideWinder,
    LogitechG105,
    LogitechG710,
    LogitechG815,
}

/// Static description of a supported keyboard model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub display_name: &'static str,
    pub variant: DriverVariant,
    /// USB interface number carrying the vendor-specific reports
    pub control_interface: u8,
}

impl DeviceDescriptor {
    /// Stable identity used as the connected-keyboard registry key
    pub fn identity(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (VID: {:04X}, PID: {:04X})",
               self.display_name, self.vendor_id, self.product_id)
    }
}

/// Device nodes resolved for one connection attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevNode {
    pub hidraw: Option<PathBuf>,
    pub input_event: Option<PathBuf>,
}

impl DevNode {
    /// Both nodes were found; partial matches are never bound
    pub fn is_complete(&self) -> bool {
        self.hidraw.is_some() && self.input_event.is_some()
    }
}

/// Classification of a decoded report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum KeyKind {
    #[default]
    Unclassified,
    MacroKey,
    ExtraKey,
    RecordKey,
}

/// A decoded key press. Index 0 never names a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KeyEvent {
    pub index: u8,
    pub kind: KeyKind,
}

impl KeyEvent {
    pub const NONE: KeyEvent = KeyEvent { index: 0, kind: KeyKind::Unclassified };

    pub fn new(index: u8, kind: KeyKind) -> Self {
        if index == 0 {
            return Self::NONE;
        }
        Self { index, kind }
    }

    pub fn macro_key(index: u8) -> Self {
        Self::new(index, KeyKind::MacroKey)
    }

    pub fn extra_key(index: u8) -> Self {
        Self::new(index, KeyKind::ExtraKey)
    }

    pub fn record_key(index: u8) -> Self {
        Self::new(index, KeyKind::RecordKey)
    }

    /// Whether the event should leave the idle state at all
    pub fn is_actionable(&self) -> bool {
        self.index != 0 && self.kind != KeyKind::Unclassified
    }
}

/// One entry of a recorded macro
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroEvent {
    /// Key press (`down == true`) or release of a Linux key code
    Key { code: u16, down: bool },
    /// Pause in milliseconds
    Delay(u32),
}

/// Ordered macro event log, replayed in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroLog {
    pub events: Vec<MacroEvent>,
}

impl MacroLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: MacroEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Key entries only, in order
    pub fn keys(&self) -> impl Iterator<Item = (u16, bool)> + '_ {
        self.events.iter().filter_map(|event| match event {
            MacroEvent::Key { code, down } => Some((*code, *down)),
            MacroEvent::Delay(_) => None,
        })
    }
}

/// Directory holding the macro slots of a 0-based profile
pub fn profile_dir(root: &Path, profile: u8) -> PathBuf {
    root.join(format!("profile_{}", profile as u16 + 1))
}

/// File holding the macro recorded for `slot` in `profile`
pub fn macro_path(root: &Path, profile: u8, slot: u8) -> PathBuf {
    profile_dir(root, profile).join(format!("s{:02}.xml", slot))
}
