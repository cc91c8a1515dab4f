//! Worker-side heartbeat emission.
//!
//! Each worker child holds the write end of its heartbeat pipe, wrapped in
//! a [`WorkerTarget`]. A background emitter thread writes one zero byte per
//! `heartbeat_interval`; any successful read of the pipe on the monitor
//! side counts as liveness, so the content never matters.
//!
//! Writes are unbuffered and the pipe is non-blocking. A full pipe means
//! the supervisor has not drained heartbeats for tens of thousands of
//! intervals, which is treated like any other write failure: the
//! configured [`HeartbeatPolicy`] decides what the child does about it.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What a worker child does when a heartbeat write fails.
#[derive(Clone, Default)]
pub enum HeartbeatPolicy {
    /// Exit the child process with status 1. A worker that cannot reach
    /// its supervisor is assumed orphaned.
    #[default]
    Abort,

    /// Stop emitting and keep running. The supervisor will eventually
    /// escalate on heartbeat timeout.
    Ignore,

    /// Invoke the callback with the write error, then stop emitting.
    Handler(Arc<dyn Fn(&io::Error) + Send + Sync>),
}

impl fmt::Debug for HeartbeatPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "Abort"),
            Self::Ignore => write!(f, "Ignore"),
            Self::Handler(_) => write!(f, "Handler(..)"),
        }
    }
}

/// The worker-facing end of the heartbeat pipe.
///
/// Handed to the worker function at spawn. Workers that rely on the
/// automatic emitter may ignore it entirely; workers that block for long
/// stretches can force extra beats with [`WorkerTarget::heartbeat`], and
/// workers that want the supervisor to see an EOF early can
/// [`WorkerTarget::close`] it.
#[derive(Clone, Debug)]
pub struct WorkerTarget {
    pipe: Arc<Mutex<Option<File>>>,
}

impl WorkerTarget {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self {
            pipe: Arc::new(Mutex::new(Some(File::from(fd)))),
        }
    }

    /// Force one extra heartbeat right now.
    ///
    /// A no-op once the target has been closed.
    ///
    /// # Errors
    ///
    /// The underlying write error, including `WouldBlock` when the pipe
    /// is full.
    pub fn heartbeat(&self) -> io::Result<()> {
        self.pulse().map(|_| ())
    }

    /// Release the pipe write end. The monitor side observes EOF once
    /// every copy of the write end (including the emitter's) is gone.
    pub fn close(&self) {
        self.pipe.lock().unwrap().take();
    }

    /// Write one heartbeat byte. `Ok(false)` means the target was closed.
    fn pulse(&self) -> io::Result<bool> {
        let guard = self.pipe.lock().unwrap();
        match guard.as_ref() {
            Some(file) => {
                let mut out = file;
                out.write_all(&[0u8])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Start the background emitter thread inside a worker child.
///
/// The thread ends when the target is closed, or after a write failure
/// once the policy has been applied. The `Abort` policy does not return:
/// it exits the child process immediately with `_exit(1)`, skipping
/// atexit handlers that belong to the parent's image.
pub(crate) fn spawn_emitter(
    target: WorkerTarget,
    interval: Duration,
    policy: HeartbeatPolicy,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("prefork-heartbeat".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            match target.pulse() {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    match policy {
                        HeartbeatPolicy::Abort => {
                            eprintln!("prefork worker: heartbeat write failed: {err}");
                            // SAFETY: process exit, no further code runs.
                            unsafe { libc::_exit(1) }
                        }
                        HeartbeatPolicy::Ignore => {}
                        HeartbeatPolicy::Handler(ref handler) => (**handler)(&err),
                    }
                    return;
                }
            }
        })
}
