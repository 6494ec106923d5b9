//! Macro recording and playback
//!
//! Recording turns captured key events into a [`MacroLog`]. Playback replays a
//! log through an [`Injector`] on a detached task. Concurrent playbacks are not
//! ordered against each other; the last write on the sink wins.

use sidewinderd_common::{tracing, MacroEvent, MacroLog};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use crate::injector::Injector;
use crate::input::CapturedKey;
use crate::keyboard::POLL_TIMEOUT_MS;

/// Gaps at or below this are not recorded
pub const NEGLIGIBLE_DELAY: Duration = Duration::from_millis(1);

const KEY_AUTOREPEAT: i32 = 2;

/// Builds a macro log from captured key events
pub struct MacroRecorder {
    log: MacroLog,
    capture_delays: bool,
    last: Option<SystemTime>,
}

impl MacroRecorder {
    pub fn new(capture_delays: bool) -> Self {
        Self {
            log: MacroLog::new(),
            capture_delays,
            last: None,
        }
    }

    /// Append one captured event. Autorepeat is dropped.
    pub fn capture(&mut self, key: &CapturedKey) {
        if key.value == KEY_AUTOREPEAT {
            return;
        }

        if self.capture_delays {
            if let Some(last) = self.last {
                let elapsed = key.time.duration_since(last).unwrap_or_default();
                if elapsed > NEGLIGIBLE_DELAY {
                    let ms = u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX);
                    self.log.push(MacroEvent::Delay(ms));
                }
            }
        }

        self.log.push(MacroEvent::Key {
            code: key.code,
            down: key.value != 0,
        });
        self.last = Some(key.time);
    }

    pub fn log(&self) -> &MacroLog {
        &self.log
    }

    pub fn finish(self) -> MacroLog {
        self.log
    }
}

/// Sleep `ms` in slices of at most [`POLL_TIMEOUT_MS`]. Returns false as soon
/// as `alive` turns false.
async fn sleep_while_alive(ms: u32, alive: &AtomicBool) -> bool {
    let mut remaining = Duration::from_millis(ms as u64);
    let slice = Duration::from_millis(POLL_TIMEOUT_MS as u64);

    while !remaining.is_zero() {
        if !alive.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining -= step;
    }

    alive.load(Ordering::Relaxed)
}

/// Replay `log` through `injector`. Stops before the next entry, or in the
/// middle of a delay, once `alive` turns false. Returns the number of entries
/// replayed.
pub async fn play_macro(log: &MacroLog, injector: &dyn Injector, alive: &AtomicBool) -> usize {
    let mut played = 0;

    for event in &log.events {
        if !alive.load(Ordering::Relaxed) {
            info!("Keyboard gone, stopping playback after {} events", played);
            break;
        }

        match *event {
            MacroEvent::Key { code, down } => {
                let result = if down {
                    injector.key_press(code).await
                } else {
                    injector.key_release(code).await
                };
                if let Err(e) = result {
                    error!("Failed to inject key {}: {}", code, e);
                }
            }
            MacroEvent::Delay(ms) => {
                if !sleep_while_alive(ms, alive).await {
                    info!("Keyboard gone during a {} ms delay, stopping playback", ms);
                    break;
                }
            }
        }
        played += 1;
    }

    played
}

/// Read the macro stored at `path`. Missing or malformed documents are empty.
pub async fn load_for_playback(path: &Path) -> MacroLog {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("No macro at {}: {}", path.display(), e);
            return MacroLog::new();
        }
    };

    match sidewinderd_common::macro_doc::parse_macro(&raw) {
        Ok(log) => log,
        Err(e) => {
            warn!("Ignoring macro {}: {}", path.display(), e);
            MacroLog::new()
        }
    }
}

/// Play the macro stored at `path` on a detached task
pub fn spawn_playback(
    runtime: &tokio::runtime::Handle,
    path: PathBuf,
    injector: Arc<dyn Injector>,
    alive: Arc<AtomicBool>,
) {
    runtime.spawn(async move {
        let log = load_for_playback(&path).await;
        let played = play_macro(&log, injector.as_ref(), &alive).await;
        debug!("Macro {} done ({} events)", path.display(), played);
    });
}
