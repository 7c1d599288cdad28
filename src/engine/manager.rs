//! Engine lifecycle management.
//!
//! A process-wide manager hands out engine references to sessions and
//! retires old generations. `create` starts a new generation from a
//! configuration path (the control channel's "update" command maps to
//! exactly this); `acquire` returns the current generation or declines;
//! release rides on `Drop` of the last [`EngineSlot`] reference, so it is
//! guaranteed on every exit path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::core::{WafError, WafResult};

use super::RulesEngine;

/// Builds an engine instance from a configuration path.
pub type EngineFactory = dyn Fn(&Path) -> WafResult<Arc<dyn RulesEngine>> + Send + Sync;

/// One engine generation. Sessions hold an `Arc<EngineSlot>` for their
/// whole lifetime; the generation stays alive until the last holder
/// drops it and `cleanup` retires it.
pub struct EngineSlot {
    pub generation: u64,
    pub engine: Arc<dyn RulesEngine>,
    pub config_path: PathBuf,
}

pub struct EngineManager {
    factory: Box<EngineFactory>,
    current: ArcSwapOption<EngineSlot>,
    slots: DashMap<u64, Arc<EngineSlot>>,
    next_generation: AtomicU64,
    max_engines: usize,
}

impl EngineManager {
    pub fn new(factory: Box<EngineFactory>, max_engines: usize) -> Self {
        Self {
            factory,
            current: ArcSwapOption::from(None),
            slots: DashMap::new(),
            next_generation: AtomicU64::new(1),
            max_engines: max_engines.max(1),
        }
    }

    /// Starts a new engine generation and makes it current.
    pub fn create(&self, config_path: &Path) -> WafResult<u64> {
        if self.slots.len() >= self.max_engines {
            self.cleanup();
            if self.slots.len() >= self.max_engines {
                return Err(WafError::EngineDeclined(format!(
                    "engine limit reached ({} live generations)",
                    self.slots.len()
                )));
            }
        }

        let engine = (self.factory)(config_path)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(EngineSlot {
            generation,
            engine,
            config_path: config_path.to_path_buf(),
        });

        self.slots.insert(generation, slot.clone());
        self.current.store(Some(slot));
        log::info!("Engine generation {generation} loaded from {}", config_path.display());
        Ok(generation)
    }

    /// Hands out the current engine generation; `None` means declined
    /// and the session proceeds in bypass mode.
    pub fn acquire(&self) -> Option<Arc<EngineSlot>> {
        self.current.load_full()
    }

    /// Returns a session's engine reference. The drop itself is what
    /// releases; this entry point exists so release sites also sweep
    /// retired generations.
    pub fn release(&self, slot: Arc<EngineSlot>) {
        drop(slot);
        self.cleanup();
    }

    /// Retires idle, non-current generations.
    pub fn cleanup(&self) {
        let current_gen = self.current.load().as_ref().map(|s| s.generation);
        self.slots.retain(|generation, slot| {
            if Some(*generation) == current_gen {
                return true;
            }
            // Registry holds one reference; anything above that is a live session.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            log::info!("Retiring idle engine generation {generation}");
            false
        });
    }

    /// Count of live generations, current included.
    pub fn live_generations(&self) -> usize {
        self.slots.len()
    }

    /// Spawns the control-channel poller: a task thread that watches the
    /// configuration file and loads a new generation when it changes.
    pub fn spawn_control_poller(
        self: &Arc<Self>,
        config_path: PathBuf,
        interval: Duration,
    ) -> ControlPoller {
        let manager = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("waf-engine-ctl".to_string())
            .spawn(move || {
                let mut last_seen = file_mtime(&config_path);
                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    let mtime = file_mtime(&config_path);
                    if mtime.is_some() && mtime != last_seen {
                        last_seen = mtime;
                        match manager.create(&config_path) {
                            Ok(generation) => {
                                log::info!("Control update: switched to generation {generation}")
                            }
                            Err(e) => log::error!("Control update failed: {e}"),
                        }
                    }
                }
            })
            .expect("spawn control poller thread");

        ControlPoller {
            stop,
            handle: Some(handle),
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Guard for the control poller thread; stops it on drop.
pub struct ControlPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ControlPoller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Process-wide manager, initialized once at plugin load.
static ENGINE_MANAGER: OnceCell<Arc<EngineManager>> = OnceCell::new();

/// Installs the process-wide manager. Later calls are ignored.
pub fn install(manager: Arc<EngineManager>) {
    let _ = ENGINE_MANAGER.set(manager);
}

/// The process-wide manager, if one has been installed.
pub fn global() -> Option<Arc<EngineManager>> {
    ENGINE_MANAGER.get().cloned()
}
