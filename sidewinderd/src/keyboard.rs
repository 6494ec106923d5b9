//! Per-keyboard state machine
//!
//! A bound keyboard runs [`Keyboard::run`] on its own blocking task. Every
//! turn of the loop waits (bounded by [`POLL_TIMEOUT_MS`]) for one report on
//! the control interface, decodes it with the model decoder and dispatches it:
//!
//! - macro key: play the slot's macro on a detached task
//! - extra key: select or cycle the profile, toggle the macro pad
//! - record key: arm recording, then record into the next macro key's slot
//!
//! Playback never blocks the loop, so several macros may play at once.

use sidewinderd_common::{
    macro_path, profile_dir, save_macro, tracing, DevNode, DeviceDescriptor, KeyEvent, KeyKind,
    MacroLog, MAX_PROFILE,
};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{DriverError, DriverResult};
use crate::hid::HidTransport;
use crate::injector::Injector;
use crate::input::KeyStreamOpener;
use crate::led::IndicatorGroup;
use crate::macro_engine::{spawn_playback, MacroRecorder};
use crate::vendor::{self, ExtraAction, VendorLeds, MAX_REPORT_SIZE};

/// Upper bound of every wait, so shutdown and disconnects are noticed
pub const POLL_TIMEOUT_MS: u16 = 200;

#[derive(Debug, Clone)]
pub struct KeyboardSettings {
    pub capture_delays: bool,
    /// 0-based profile selected when the keyboard is bound
    pub initial_profile: u8,
    /// Root of the per-profile macro directories
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Ready,
    Idle,
    Gone,
}

fn classify(revents: Option<PollFlags>) -> Wake {
    let revents = revents.unwrap_or(PollFlags::empty());
    if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
        Wake::Gone
    } else if revents.contains(PollFlags::POLLIN) {
        Wake::Ready
    } else {
        Wake::Idle
    }
}

pub struct Keyboard {
    descriptor: DeviceDescriptor,
    dev_node: DevNode,
    hid: Arc<dyn HidTransport>,
    group: IndicatorGroup,
    leds: VendorLeds,
    injector: Arc<dyn Injector>,
    key_stream: KeyStreamOpener,
    settings: KeyboardSettings,
    profile: u8,
    macropad: bool,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl Keyboard {
    /// Set up a freshly opened keyboard: profile directories, macro key
    /// reset and the initial profile LED. Failures here are logged only.
    pub fn new(
        descriptor: DeviceDescriptor,
        dev_node: DevNode,
        hid: Arc<dyn HidTransport>,
        injector: Arc<dyn Injector>,
        key_stream: KeyStreamOpener,
        settings: KeyboardSettings,
        running: Arc<AtomicBool>,
    ) -> Self {
        let mut group = IndicatorGroup::new(hid.clone());
        let leds = vendor::setup_leds(descriptor.variant, &mut group);
        let initial_profile = settings.initial_profile.min(MAX_PROFILE - 1);

        let mut keyboard = Self {
            descriptor,
            dev_node,
            hid,
            group,
            leds,
            injector,
            key_stream,
            settings,
            profile: 0,
            macropad: false,
            connected: Arc::new(AtomicBool::new(true)),
            running,
        };

        keyboard.create_profile_dirs();

        if let Err(e) = vendor::reset_macro_keys(descriptor.variant, keyboard.hid.as_ref()) {
            warn!("Failed to reset macro keys of {}: {}", descriptor, e);
        }

        if let Some(led) = &keyboard.leds.macropad {
            keyboard.macropad = led.is_on(&keyboard.group).unwrap_or(false);
        }

        if let Err(e) = keyboard.set_profile(initial_profile) {
            warn!("Failed to select initial profile on {}: {}", descriptor, e);
        }

        keyboard
    }

    fn create_profile_dirs(&self) {
        for profile in 0..MAX_PROFILE {
            let dir = profile_dir(&self.settings.workdir, profile);
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!("Cannot create profile directory {}: {}", dir.display(), e);
            }
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn profile(&self) -> u8 {
        self.profile
    }

    pub fn macropad_enabled(&self) -> bool {
        self.macropad
    }

    /// Liveness flag shared with the device manager and running playbacks
    pub fn connection(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            info!("{} disconnected", self.descriptor);
        }
    }

    fn is_active(&self) -> bool {
        self.is_connected() && self.running.load(Ordering::Relaxed)
    }

    /// Listen until the keyboard goes away or the daemon stops
    pub fn run(mut self) {
        info!("Listening on {}", self.descriptor);

        while self.is_active() {
            self.listen();
        }

        info!("Stopped listening on {}", self.descriptor);
    }

    /// Wait for one report and dispatch it
    pub fn listen(&mut self) {
        if let Some(event) = self.poll_key() {
            self.handle_key(event);
        }
    }

    fn wait_control(&self) -> Wake {
        let mut fds = [PollFd::new(self.hid.fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) | Err(Errno::EINTR) => Wake::Idle,
            Ok(_) => classify(fds[0].revents()),
            Err(e) => {
                warn!("Polling {} failed: {}", self.descriptor, e);
                Wake::Gone
            }
        }
    }

    fn poll_key(&mut self) -> Option<KeyEvent> {
        match self.wait_control() {
            Wake::Ready => Some(self.get_input()),
            Wake::Idle => None,
            Wake::Gone => {
                self.disconnect();
                None
            }
        }
    }

    /// Read one report from the control interface and decode it
    pub fn get_input(&mut self) -> KeyEvent {
        let mut buf = [0u8; MAX_REPORT_SIZE];
        match self.hid.read_report(&mut buf) {
            Ok(len) => {
                let event = vendor::decode(self.descriptor.variant, &buf[..len]);
                debug!("Report {:02x?} -> {:?}", &buf[..len], event);
                event
            }
            Err(e) if e.is_disconnect() => {
                self.disconnect();
                KeyEvent::NONE
            }
            Err(e) => {
                warn!("Failed to read report from {}: {}", self.descriptor, e);
                KeyEvent::NONE
            }
        }
    }

    pub fn handle_key(&mut self, event: KeyEvent) {
        if !event.is_actionable() {
            return;
        }

        match event.kind {
            KeyKind::MacroKey => self.play_slot(event.index),
            KeyKind::ExtraKey => self.handle_extra_key(event.index),
            KeyKind::RecordKey => self.handle_record_mode(),
            KeyKind::Unclassified => {}
        }
    }

    fn handle_extra_key(&mut self, index: u8) {
        let result = match vendor::extra_action(self.descriptor.variant, index) {
            ExtraAction::SelectProfile(profile) => self.set_profile(profile),
            ExtraAction::CycleProfile => self.switch_profile(),
            ExtraAction::ToggleMacroPad => self.toggle_macropad(),
            ExtraAction::Ignore => {
                debug!("No action for extra key {:#04x}", index);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Extra key {:#04x} on {} failed: {}", index, self.descriptor, e);
        }
    }

    fn play_slot(&self, slot: u8) {
        let path = macro_path(&self.settings.workdir, self.profile, slot);
        debug!("Playing {}", path.display());

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => spawn_playback(&runtime, path, self.injector.clone(), self.connected.clone()),
            Err(e) => warn!("Cannot play {}: {}", path.display(), e),
        }
    }

    /// Make `profile` active and light its LED
    pub fn set_profile(&mut self, profile: u8) -> DriverResult<()> {
        if profile >= MAX_PROFILE {
            return Err(DriverError::InvalidProfile(profile));
        }

        self.profile = profile;
        info!("{}: profile {}", self.descriptor, profile as u16 + 1);

        if let Some(led) = self.leds.profiles.get(profile as usize) {
            led.on(&mut self.group)?;
        }
        Ok(())
    }

    pub fn switch_profile(&mut self) -> DriverResult<()> {
        self.set_profile((self.profile + 1) % MAX_PROFILE)
    }

    pub fn toggle_macropad(&mut self) -> DriverResult<()> {
        let Some(led) = &self.leds.macropad else {
            return Ok(());
        };

        if self.macropad {
            led.off(&mut self.group)?;
        } else {
            led.on(&mut self.group)?;
        }
        self.macropad = !self.macropad;
        info!("{}: macro pad {}", self.descriptor, if self.macropad { "on" } else { "off" });
        Ok(())
    }

    fn record_led_off(&mut self) {
        if let Err(e) = self.leds.record.off(&mut self.group) {
            debug!("Record LED off failed on {}: {}", self.descriptor, e);
        }
    }

    /// Record LED on, then wait for the slot to record into. The record key
    /// cancels; any other extra key cancels and is handled normally.
    pub fn handle_record_mode(&mut self) {
        if let Err(e) = self.leds.record.on(&mut self.group) {
            warn!("Record LED on failed on {}: {}", self.descriptor, e);
        }

        while self.is_active() {
            let Some(event) = self.poll_key() else {
                continue;
            };

            match event.kind {
                KeyKind::MacroKey => {
                    if let Err(e) = self.leds.record.blink(&mut self.group) {
                        warn!("Record LED blink failed on {}: {}", self.descriptor, e);
                    }

                    let path = macro_path(&self.settings.workdir, self.profile, event.index);
                    match self.record_macro(&path) {
                        Ok(Some(log)) => info!("Recorded {} events to {}", log.len(), path.display()),
                        Ok(None) => info!("Recording for {} aborted", path.display()),
                        Err(e) => {
                            error!("Recording for {} failed: {}", path.display(), e);
                            self.record_led_off();
                        }
                    }
                    return;
                }
                KeyKind::RecordKey => {
                    self.record_led_off();
                    return;
                }
                KeyKind::ExtraKey => {
                    self.record_led_off();
                    self.handle_key(event);
                    return;
                }
                KeyKind::Unclassified => {}
            }
        }

        self.record_led_off();
    }

    /// Capture keystrokes from the input event node until the record key is
    /// pressed again, then save them to `path`. Returns `None` without saving
    /// when the keyboard disconnects or the daemon stops first.
    pub fn record_macro(&mut self, path: &Path) -> DriverResult<Option<MacroLog>> {
        let input = self.dev_node.input_event.clone().ok_or_else(|| DriverError::MissingNode {
            device: self.descriptor.to_string(),
            node: "input event",
        })?;

        info!("Start macro recording on {}", input.display());
        let mut stream = (self.key_stream)(&input)?;
        let mut recorder = MacroRecorder::new(self.settings.capture_delays);

        loop {
            if !self.is_active() {
                return Ok(None);
            }

            let (control, capture) = {
                let mut fds = [
                    PollFd::new(self.hid.fd(), PollFlags::POLLIN),
                    PollFd::new(stream.fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                    Ok(0) | Err(Errno::EINTR) => continue,
                    Ok(_) => (classify(fds[0].revents()), classify(fds[1].revents())),
                    Err(e) => return Err(e.into()),
                }
            };

            // keystrokes first, they happened before the record key report
            if capture == Wake::Ready {
                for key in stream.read_keys()? {
                    recorder.capture(&key);
                }
            }

            if control == Wake::Gone {
                self.disconnect();
                return Ok(None);
            }

            if capture == Wake::Gone {
                warn!("Input node {} went away while recording", input.display());
                self.record_led_off();
                return Ok(None);
            }

            if control == Wake::Ready && self.get_input().kind == KeyKind::RecordKey {
                break;
            }
        }

        self.record_led_off();
        let log = recorder.finish();
        save_macro(path, &log)?;
        info!("Exit macro recording");
        Ok(Some(log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::EV_KEY;
    use crate::testing::{FakeHid, FakeKeyInput, RecordingInjector};
    use sidewinderd_common::{load_macro, DriverVariant, MacroEvent};
    use std::time::Duration;
    use tempfile::TempDir;

    const SIDEWINDER_X6: DeviceDescriptor = DeviceDescriptor {
        vendor_id: 0x045e,
        product_id: 0x074b,
        display_name: "Microsoft SideWinder X6",
        variant: DriverVariant::SideWinder,
        control_interface: 1,
    };

    const G105: DeviceDescriptor = DeviceDescriptor {
        vendor_id: 0x046d,
        product_id: 0xc248,
        display_name: "Logitech G105",
        variant: DriverVariant::LogitechG105,
        control_interface: 1,
    };

    const RECORD: [u8; 8] = [1, 0, 0, 0, 0, 0, 0x11, 0];
    const GAMECENTER: [u8; 8] = [1, 0, 0, 0, 0, 0, 0x10, 0];
    const PROFILE: [u8; 8] = [1, 0, 0, 0, 0, 0, 0x14, 0];
    const S3: [u8; 5] = [8, 0x04, 0, 0, 0];

    struct Harness {
        keyboard: Keyboard,
        hid: Arc<FakeHid>,
        input: Arc<FakeKeyInput>,
        injector: Arc<RecordingInjector>,
        workdir: TempDir,
    }

    fn harness(descriptor: DeviceDescriptor, initial_profile: u8) -> Harness {
        let workdir = TempDir::new().unwrap();
        let hid = FakeHid::new();
        let input = FakeKeyInput::new();
        let injector = RecordingInjector::new();
        let settings = KeyboardSettings {
            capture_delays: true,
            initial_profile,
            workdir: workdir.path().to_path_buf(),
        };
        let dev_node = DevNode {
            hidraw: Some(PathBuf::from("/dev/hidraw7")),
            input_event: Some(PathBuf::from("/dev/input/event7")),
        };

        let keyboard = Keyboard::new(
            descriptor,
            dev_node,
            hid.clone(),
            injector.clone(),
            input.opener(),
            settings,
            Arc::new(AtomicBool::new(true)),
        );

        Harness { keyboard, hid, input, injector, workdir }
    }

    #[test]
    fn test_construction_creates_profile_dirs_and_lights_profile() {
        let h = harness(SIDEWINDER_X6, 1);

        for profile in 0..MAX_PROFILE {
            assert!(profile_dir(h.workdir.path(), profile).is_dir());
        }
        assert_eq!(h.keyboard.profile(), 1);
        assert_eq!(h.hid.feature(0x07), 0x08);
        assert!(h.keyboard.is_connected());
    }

    #[test]
    fn test_logitech_construction_resets_macro_keys() {
        let h = harness(G105, 0);
        let writes = h.hid.feature_writes();
        assert_eq!(writes[0], vec![0x08, 0, 0, 0, 0, 0, 0]);
        assert_eq!(h.hid.feature(0x06), 0x01);
    }

    #[test]
    fn test_profile_wraparound() {
        let mut h = harness(SIDEWINDER_X6, 0);

        for _ in 0..MAX_PROFILE {
            h.keyboard.switch_profile().unwrap();
        }
        assert_eq!(h.keyboard.profile(), 0);

        for expected in [1, 2, 0] {
            h.hid.push_report(&PROFILE);
            h.keyboard.listen();
            assert_eq!(h.keyboard.profile(), expected);
        }
        assert_eq!(h.hid.feature(0x07), 0x04);
    }

    #[test]
    fn test_out_of_range_profile_is_rejected() {
        let mut h = harness(G105, 2);
        assert!(matches!(h.keyboard.set_profile(3), Err(DriverError::InvalidProfile(3))));
        assert_eq!(h.keyboard.profile(), 2);
    }

    #[test]
    fn test_logitech_m_keys_select_profile() {
        let mut h = harness(G105, 0);

        h.hid.push_report(&[3, 0, 0x04]);
        h.keyboard.listen();
        assert_eq!(h.keyboard.profile(), 2);
        assert_eq!(h.hid.feature(0x06), 0x04);
    }

    #[test]
    fn test_gamecenter_toggles_macropad_keeping_leds() {
        let mut h = harness(SIDEWINDER_X6, 0);

        h.hid.push_report(&GAMECENTER);
        h.keyboard.listen();
        assert!(h.keyboard.macropad_enabled());
        assert_eq!(h.hid.feature(0x07), 0x05);

        h.keyboard.switch_profile().unwrap();
        assert_eq!(h.hid.feature(0x07), 0x09);

        h.hid.push_report(&GAMECENTER);
        h.keyboard.listen();
        assert!(!h.keyboard.macropad_enabled());
        assert_eq!(h.hid.feature(0x07), 0x08);
    }

    #[test]
    fn test_unclassified_report_is_noop() {
        let mut h = harness(SIDEWINDER_X6, 0);
        let before = h.hid.feature_writes().len();

        h.hid.push_report(&[0x42, 0x00, 0x01]);
        h.keyboard.listen();

        assert_eq!(h.hid.feature_writes().len(), before);
        assert!(h.keyboard.is_connected());
    }

    #[test]
    fn test_listen_times_out_without_input() {
        let mut h = harness(SIDEWINDER_X6, 0);
        h.keyboard.listen();
        assert!(h.keyboard.is_connected());
    }

    #[test]
    fn test_unplugged_device_disconnects() {
        let mut h = harness(SIDEWINDER_X6, 0);
        let connection = h.keyboard.connection();

        h.hid.unplug();
        h.keyboard.listen();

        assert!(!connection.load(Ordering::Relaxed));
    }

    #[test]
    fn test_record_then_save() {
        let mut h = harness(SIDEWINDER_X6, 0);

        h.input.push_key(30, 1, 0);
        h.input.push_key(30, 2, 250);
        h.input.push_key(30, 0, 300);
        h.input.push_key(48, 1, 300);
        h.input.push_key(48, 0, 420);

        h.hid.push_report(&RECORD);
        h.hid.push_report(&S3);
        h.hid.push_report(&RECORD);
        h.keyboard.listen();

        let saved = load_macro(&macro_path(h.workdir.path(), 0, 3)).unwrap();
        assert_eq!(
            saved.events,
            vec![
                MacroEvent::Key { code: 30, down: true },
                MacroEvent::Delay(300),
                MacroEvent::Key { code: 30, down: false },
                MacroEvent::Key { code: 48, down: true },
                MacroEvent::Delay(120),
                MacroEvent::Key { code: 48, down: false },
            ]
        );
        // record LED off again, profile LED untouched
        assert_eq!(h.hid.feature(0x07), 0x04);
    }

    #[test]
    fn test_record_key_cancels_armed_mode() {
        let mut h = harness(SIDEWINDER_X6, 0);

        h.hid.push_report(&RECORD);
        h.hid.push_report(&RECORD);
        h.keyboard.listen();

        assert_eq!(h.hid.feature(0x07), 0x04);
        assert!(!macro_path(h.workdir.path(), 0, 3).exists());
        assert_eq!(h.input.opened(), 0);
    }

    #[test]
    fn test_extra_key_cancels_and_is_dispatched() {
        let mut h = harness(SIDEWINDER_X6, 0);

        h.hid.push_report(&RECORD);
        h.hid.push_report(&PROFILE);
        h.keyboard.listen();

        assert_eq!(h.keyboard.profile(), 1);
        assert_eq!(h.hid.feature(0x07), 0x08);
    }

    #[test]
    fn test_recording_aborts_on_disconnect() {
        let mut h = harness(SIDEWINDER_X6, 0);

        h.input.push_key(30, 1, 0);
        h.hid.unplug();
        let path = macro_path(h.workdir.path(), 0, 3);
        assert!(h.keyboard.record_macro(&path).unwrap().is_none());
        assert!(!path.exists());
        assert!(!h.keyboard.is_connected());
    }

    #[test]
    fn test_recording_without_input_node_fails() {
        let mut h = harness(SIDEWINDER_X6, 0);
        h.keyboard.dev_node.input_event = None;

        let path = macro_path(h.workdir.path(), 0, 1);
        assert!(matches!(
            h.keyboard.record_macro(&path),
            Err(DriverError::MissingNode { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_macro_key_plays_saved_macro() {
        let h = harness(SIDEWINDER_X6, 2);
        let log = MacroLog {
            events: vec![
                MacroEvent::Key { code: 57, down: true },
                MacroEvent::Delay(5),
                MacroEvent::Key { code: 57, down: false },
            ],
        };
        save_macro(&macro_path(h.workdir.path(), 2, 3), &log).unwrap();

        let Harness { mut keyboard, hid, injector, workdir: _workdir, .. } = h;
        hid.push_report(&S3);
        let keyboard = tokio::task::spawn_blocking(move || {
            keyboard.listen();
            keyboard
        })
        .await
        .unwrap();

        for _ in 0..100 {
            if injector.events().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(injector.events(), vec![(EV_KEY, 57, 1), (EV_KEY, 57, 0)]);
        assert!(keyboard.is_connected());
    }
}
