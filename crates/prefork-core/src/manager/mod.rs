//! Worker spawning and the supervision tick loop.
//!
//! The [`ProcessManager`] owns every live [`Monitor`] together with the
//! read ends of the worker heartbeat pipes. One tick multiplexes
//! readiness across all pipes, refreshes heartbeat timestamps, and then
//! advances every monitor's kill state machine on a single clock sample.
//!
//! A single mutex serializes tick iterations against spawn registration;
//! monitors are shared handles, so stop and reload requests from other
//! threads do not need the manager lock at all.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{fork, pipe2, ForkResult};
use tracing::{debug, info, warn};

use crate::config::{CloexecMode, ConfigError, KillPolicy, SupervisorConfig};
use crate::heartbeat::{spawn_emitter, WorkerTarget};
use crate::monitor::Monitor;

/// Upper bound on bytes drained from one pipe per ready event. The
/// content is discarded; any successful read counts as liveness.
const HEARTBEAT_READ_CHUNK: usize = 1024;

/// Spawns worker children and drives their monitors.
///
/// Cheaply cloneable; all clones share the same supervisor state. With
/// `auto_tick` enabled (the default) a background thread runs the tick
/// loop until [`ProcessManager::close`] is called.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    shared: Arc<ManagerShared>,
}

#[derive(Debug)]
struct ManagerShared {
    config: SupervisorConfig,
    policy: KillPolicy,
    inner: Mutex<ManagerInner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct ManagerInner {
    /// Monitors in creation order.
    monitors: Vec<Monitor>,
    /// Heartbeat pipe read ends, keyed by raw fd. The fd never leaves
    /// this map; ownership of the read end is singular.
    pipes: HashMap<RawFd, PipeEntry>,
    /// One-way flag: no spawns and no ticks once set.
    closed: bool,
}

#[derive(Debug)]
struct PipeEntry {
    file: File,
    monitor: Monitor,
}

enum ReadOutcome {
    Beat,
    Evict(Option<io::Error>),
    Skip,
}

impl ProcessManager {
    /// Create a manager from a validated configuration and, unless
    /// `auto_tick` is disabled, start the background tick thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SupervisorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = config.kill_policy()?;
        let manager = Self {
            shared: Arc::new(ManagerShared {
                config,
                policy,
                inner: Mutex::new(ManagerInner {
                    monitors: Vec::new(),
                    pipes: HashMap::new(),
                    closed: false,
                }),
                ticker: Mutex::new(None),
            }),
        };
        if manager.shared.config.auto_tick {
            manager.start_auto_tick();
        }
        Ok(manager)
    }

    /// The configuration this manager runs with.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Whether [`ProcessManager::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().unwrap().closed
    }

    /// Number of monitors still tracked (live or not yet reaped).
    #[must_use]
    pub fn monitor_count(&self) -> usize {
        self.shared.inner.lock().unwrap().monitors.len()
    }

    /// Fork a worker child running `worker_fn` and return its monitor.
    ///
    /// The parent installs a private heartbeat pipe for the child and
    /// keeps only the read end; the child keeps only the write end,
    /// wrapped in the [`WorkerTarget`] handed to `worker_fn`. The child
    /// leaves via `_exit`: 0 on clean return, 1 on panic (the panic is
    /// reported on the child's stderr).
    ///
    /// # Errors
    ///
    /// Pipe or fork failure, or [`SpawnError::Closed`] after `close`.
    pub fn spawn<F>(&self, worker_fn: F) -> Result<Monitor, SpawnError>
    where
        F: FnOnce(WorkerTarget),
    {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed {
            return Err(SpawnError::Closed);
        }

        let (read_fd, write_fd) =
            pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(SpawnError::Pipe)?;
        match self.shared.config.cloexec_mode {
            CloexecMode::Both => {}
            // The end that must survive an exec gets its flag cleared.
            CloexecMode::TargetOnly => clear_cloexec(&read_fd).map_err(SpawnError::Pipe)?,
            CloexecMode::MonitorOnly => clear_cloexec(&write_fd).map_err(SpawnError::Pipe)?,
        }

        // SAFETY: the child touches only its own copies of the pipe fds
        // and never returns from child_main.
        match unsafe { fork() }.map_err(SpawnError::Fork)? {
            ForkResult::Child => {
                drop(read_fd);
                child_main(write_fd, &self.shared.config, worker_fn)
            }
            ForkResult::Parent { child } => {
                drop(write_fd);
                let monitor = Monitor::new(child, self.shared.policy.clone(), Instant::now());
                info!(monitor = %monitor.id(), pid = %child, "spawned worker");
                inner.pipes.insert(
                    read_fd.as_raw_fd(),
                    PipeEntry {
                        file: File::from(read_fd),
                        monitor: monitor.clone(),
                    },
                );
                inner.monitors.push(monitor.clone());
                Ok(monitor)
            }
        }
    }

    /// One iteration of the supervisor loop.
    ///
    /// Waits up to `blocking_timeout` for heartbeat readiness, applies
    /// all heartbeat updates, then advances every monitor at a single
    /// clock sample. Per-child failures are contained here: a broken
    /// pipe evicts that pipe and starts an immediate stop for its
    /// monitor, nothing more.
    ///
    /// # Errors
    ///
    /// [`TickError::Closed`] once the manager has been closed.
    pub fn tick(&self, blocking_timeout: Duration) -> Result<(), TickError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed {
            return Err(TickError::Closed);
        }

        if inner.pipes.is_empty() {
            drop(inner);
            thread::sleep(blocking_timeout);
            return Ok(());
        }

        let keys: Vec<RawFd> = inner.pipes.keys().copied().collect();
        let mut poll_fds: Vec<PollFd> = keys
            .iter()
            .map(|fd| PollFd::new(inner.pipes[fd].file.as_fd(), PollFlags::POLLIN))
            .collect();

        let millis = i32::try_from(blocking_timeout.as_millis()).unwrap_or(i32::MAX);
        let ready_count = match poll(
            &mut poll_fds,
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX),
        ) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(errno) => {
                warn!(%errno, "heartbeat poll failed");
                0
            }
        };

        // One clock sample for the whole iteration.
        let now = Instant::now();

        let ready: Vec<RawFd> = if ready_count > 0 {
            keys.iter()
                .zip(&poll_fds)
                .filter_map(|(fd, poll_fd)| {
                    let revents = poll_fd.revents().unwrap_or(PollFlags::empty());
                    let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                    revents.intersects(wanted).then_some(*fd)
                })
                .collect()
        } else {
            Vec::new()
        };
        drop(poll_fds);

        // All heartbeat updates land before any kill-state advance, so a
        // beat arriving in this iteration prevents escalation in it.
        for fd in ready {
            Self::drain_pipe(&mut inner, fd, now);
        }

        inner.monitors.retain(|monitor| monitor.tick(now));
        Ok(())
    }

    /// Release every pipe and refuse further work. Idempotent. Joins the
    /// auto-tick thread, which observes [`TickError::Closed`] and exits.
    pub fn close(&self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.closed {
                inner.closed = true;
                inner.pipes.clear();
                info!("process manager closed");
            }
        }
        let handle = self.shared.ticker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn start_auto_tick(&self) {
        let manager = self.clone();
        let interval = self.shared.config.tick_interval;
        let handle = thread::Builder::new()
            .name("prefork-tick".to_string())
            .spawn(move || loop {
                match manager.tick(interval) {
                    Ok(()) => {}
                    Err(TickError::Closed) => {
                        debug!("tick loop stopped: manager closed");
                        return;
                    }
                }
            })
            .expect("failed to spawn supervisor tick thread");
        *self.shared.ticker.lock().unwrap() = Some(handle);
    }

    fn drain_pipe(inner: &mut ManagerInner, fd: RawFd, now: Instant) {
        let mut buf = [0u8; HEARTBEAT_READ_CHUNK];
        let outcome = match inner.pipes.get_mut(&fd) {
            None => return,
            Some(entry) => match (&entry.file).read(&mut buf) {
                Ok(0) => ReadOutcome::Evict(None),
                Ok(_) => ReadOutcome::Beat,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    ReadOutcome::Skip
                }
                Err(err) => ReadOutcome::Evict(Some(err)),
            },
        };

        match outcome {
            ReadOutcome::Beat => {
                if let Some(entry) = inner.pipes.get(&fd) {
                    entry.monitor.record_heartbeat(now);
                }
            }
            ReadOutcome::Evict(err) => {
                // Entry leaves the map before the monitor is advanced;
                // dropping it closes the read end.
                if let Some(entry) = inner.pipes.remove(&fd) {
                    match err {
                        None => debug!(monitor = %entry.monitor.id(), "worker heartbeat pipe closed"),
                        Some(err) => {
                            warn!(monitor = %entry.monitor.id(), %err, "worker heartbeat pipe failed");
                        }
                    }
                    entry.monitor.start_immediate_stop(now);
                }
            }
            ReadOutcome::Skip => {}
        }
    }
}

/// Entry point of a freshly forked worker child. Never returns; every
/// path leaves through `_exit` so no parent-owned atexit handlers run.
fn child_main<F>(write_fd: OwnedFd, config: &SupervisorConfig, worker_fn: F) -> !
where
    F: FnOnce(WorkerTarget),
{
    let target = WorkerTarget::new(write_fd);

    if config.auto_heartbeat {
        if let Err(err) = spawn_emitter(
            target.clone(),
            config.heartbeat_interval,
            config.on_heartbeat_error.clone(),
        ) {
            eprintln!("prefork worker: failed to start heartbeat emitter: {err}");
            // SAFETY: process exit, no further code runs.
            unsafe { libc::_exit(1) }
        }
    }

    match panic::catch_unwind(AssertUnwindSafe(|| worker_fn(target))) {
        Ok(()) => {
            // SAFETY: process exit, no further code runs.
            unsafe { libc::_exit(0) }
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<opaque panic payload>");
            eprintln!("prefork worker: uncaught panic: {message}");
            // SAFETY: process exit, no further code runs.
            unsafe { libc::_exit(1) }
        }
    }
}

fn clear_cloexec(fd: &OwnedFd) -> nix::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD)?);
    fcntl(raw, FcntlArg::F_SETFD(flags.difference(FdFlag::FD_CLOEXEC)))?;
    Ok(())
}

/// Errors from [`ProcessManager::spawn`].
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The manager has been closed.
    #[error("process manager is closed")]
    Closed,

    /// Heartbeat pipe creation failed.
    #[error("failed to create heartbeat pipe: {0}")]
    Pipe(#[source] Errno),

    /// The fork itself failed.
    #[error("fork failed: {0}")]
    Fork(#[source] Errno),
}

/// Errors from [`ProcessManager::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TickError {
    /// The manager has been closed; this is the expected way the tick
    /// loop ends, not a failure.
    #[error("process manager is closed")]
    Closed,
}
