//! Worker-pool keepalive.
//!
//! The [`MultiWorkerController`] keeps the first `num_workers` slots of
//! its slot table occupied by live monitors, replacing dead occupants
//! and staggering starts so a crash loop never turns into a spawn
//! stampede. The slot index is the worker id and survives every restart
//! of that slot.
//!
//! Starting a worker is a seam: the controller calls a caller-supplied
//! hook (typically a closure around [`ProcessManager::spawn`]) and only
//! manages the resulting monitor.
//!
//! [`ProcessManager::spawn`]: crate::manager::ProcessManager::spawn

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{ConfigError, SupervisorConfig};
use crate::manager::SpawnError;
use crate::monitor::{Monitor, Reaped};

/// Coarse cadence between keepalive passes in [`MultiWorkerController::run`].
/// Liveness latency is owned by the manager's tick loop, not by this wait.
const WAIT_TICK: Duration = Duration::from_millis(500);

/// Keeps `num_workers` workers alive across crashes, scale operations,
/// and restarts.
#[derive(Debug)]
pub struct MultiWorkerController {
    inner: Mutex<ControllerInner>,
    /// One-way per run: set by stop/restart, cleared by resume.
    stop_requested: AtomicBool,
    start_worker_delay: Duration,
    start_worker_delay_rand: f64,
}

#[derive(Debug)]
struct ControllerInner {
    /// Slot index is the worker id. The table only ever grows; slots
    /// beyond `num_workers` drain and stay empty.
    slots: Vec<Slot>,
    num_workers: usize,
    last_start_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Slot {
    monitor: Option<Monitor>,
    restarts: u32,
}

impl MultiWorkerController {
    /// Create a controller for `config.workers` slots.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &SupervisorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Mutex::new(ControllerInner {
                slots: (0..config.workers).map(|_| Slot::default()).collect(),
                num_workers: config.workers,
                last_start_at: None,
            }),
            stop_requested: AtomicBool::new(false),
            start_worker_delay: config.start_worker_delay,
            start_worker_delay_rand: config.start_worker_delay_rand,
        })
    }

    /// Current worker target.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.inner.lock().unwrap().num_workers
    }

    /// Number of slots holding a live monitor.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|slot| slot.monitor.as_ref().is_some_and(Monitor::is_alive))
            .count()
    }

    /// Whether stop or restart has been requested and not yet resumed.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// The monitor currently occupying `worker_id`, if any.
    #[must_use]
    pub fn monitor(&self, worker_id: usize) -> Option<Monitor> {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(worker_id).and_then(|slot| slot.monitor.clone())
    }

    /// Times slot `worker_id` has been restarted.
    #[must_use]
    pub fn restart_count(&self, worker_id: usize) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(worker_id).map_or(0, |slot| slot.restarts)
    }

    /// Change the worker target. Scale-up slots are filled by the next
    /// keepalive pass; excess live workers get a graceful stop from it
    /// and drain out.
    pub fn scale(&self, num_workers: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.num_workers = num_workers;
        while inner.slots.len() < num_workers {
            inner.slots.push(Slot::default());
        }
        info!(workers = num_workers, "scaled worker target");
    }

    /// Stop every worker and inhibit respawns until [`resume`].
    ///
    /// [`resume`]: MultiWorkerController::resume
    pub fn stop(&self, graceful: bool) {
        self.stop_requested.store(true, Ordering::Release);
        info!(graceful, "stopping workers");
        for monitor in self.present_monitors() {
            monitor.send_stop(graceful);
        }
    }

    /// Stop every worker, keeping slot identity. The outer lifecycle is
    /// expected to call [`resume`] and re-enter [`run`], which restarts
    /// each drained slot under its old worker id.
    ///
    /// [`resume`]: MultiWorkerController::resume
    /// [`run`]: MultiWorkerController::run
    pub fn restart(&self, graceful: bool) {
        self.stop_requested.store(true, Ordering::Release);
        info!(graceful, "restarting workers");
        for monitor in self.present_monitors() {
            monitor.send_stop(graceful);
        }
    }

    /// Re-arm keepalive after a stop or restart.
    pub fn resume(&self) {
        self.stop_requested.store(false, Ordering::Release);
    }

    /// Deliver the reload signal to every present worker, best-effort.
    pub fn reload(&self) {
        info!("reloading workers");
        for monitor in self.present_monitors() {
            monitor.send_reload();
        }
    }

    /// Keepalive loop: runs until every slot has drained. With
    /// `stop_requested` clear this never returns under normal operation,
    /// since dead slots are replaced on the next pass.
    pub fn run<F>(&self, mut start_worker: F)
    where
        F: FnMut(usize) -> Result<Monitor, SpawnError>,
    {
        loop {
            let live = self.keepalive(&mut start_worker);
            if live == 0 {
                info!("all workers drained");
                return;
            }
            thread::sleep(WAIT_TICK);
        }
    }

    /// One keepalive pass. Counts live slots, replaces dead ones within
    /// the target (unless stopping), drains the ones beyond it. Returns
    /// the live count, scale-down stragglers included.
    pub fn keepalive<F>(&self, start_worker: &mut F) -> usize
    where
        F: FnMut(usize) -> Result<Monitor, SpawnError>,
    {
        let mut live = 0;
        let slot_count = self.inner.lock().unwrap().slots.len();

        for worker_id in 0..slot_count {
            let (monitor, num_workers) = {
                let inner = self.inner.lock().unwrap();
                (inner.slots[worker_id].monitor.clone(), inner.num_workers)
            };

            match monitor {
                Some(monitor) => match monitor.try_join() {
                    Reaped::StillRunning => {
                        if worker_id >= num_workers {
                            // Scale-down: ask nicely, count it until gone.
                            monitor.send_stop(true);
                        }
                        live += 1;
                    }
                    Reaped::Exited(exit) => {
                        info!(worker = worker_id, %exit, "worker slot died");
                        self.clear_slot(worker_id);
                        if worker_id < num_workers && !self.is_stop_requested() {
                            live += usize::from(self.start_slot(worker_id, start_worker, true));
                        }
                    }
                    Reaped::AlreadyReaped => {
                        self.clear_slot(worker_id);
                        if worker_id < num_workers && !self.is_stop_requested() {
                            live += usize::from(self.start_slot(worker_id, start_worker, true));
                        }
                    }
                },
                None => {
                    if worker_id < num_workers && !self.is_stop_requested() {
                        live += usize::from(self.start_slot(worker_id, start_worker, false));
                    }
                }
            }
        }
        live
    }

    fn present_monitors(&self) -> Vec<Monitor> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter_map(|slot| slot.monitor.clone())
            .collect()
    }

    fn clear_slot(&self, worker_id: usize) {
        self.inner.lock().unwrap().slots[worker_id].monitor = None;
    }

    /// Stagger, then ask the start hook for a fresh monitor. Returns
    /// whether the slot is now occupied.
    fn start_slot<F>(&self, worker_id: usize, start_worker: &mut F, replacement: bool) -> bool
    where
        F: FnMut(usize) -> Result<Monitor, SpawnError>,
    {
        self.delay_start();
        match start_worker(worker_id) {
            Ok(monitor) => {
                let mut inner = self.inner.lock().unwrap();
                let slot = &mut inner.slots[worker_id];
                if replacement {
                    slot.restarts += 1;
                }
                info!(
                    worker = worker_id,
                    monitor = %monitor.id(),
                    restarts = slot.restarts,
                    "worker started"
                );
                slot.monitor = Some(monitor);
                true
            }
            Err(err) => {
                // Left empty; the next keepalive pass retries.
                warn!(worker = worker_id, %err, "failed to start worker");
                false
            }
        }
    }

    /// Sleep out the remainder of the jittered stagger since the last
    /// start, then stamp the new start time.
    fn delay_start(&self) {
        if self.start_worker_delay.is_zero() {
            return;
        }

        let spread = (rand::random::<f64>() - 0.5) * self.start_worker_delay_rand;
        let delay = self.start_worker_delay.mul_f64((1.0 + spread).max(0.0));

        let last_start_at = self.inner.lock().unwrap().last_start_at;
        if let Some(last) = last_start_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                thread::sleep(delay - elapsed);
            }
        }
        self.inner.lock().unwrap().last_start_at = Some(Instant::now());
    }
}
