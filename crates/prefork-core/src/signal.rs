//! Signal helpers shared by the monitor and manager.
//!
//! Signal names are configured as strings ("TERM", "SIGQUIT", ...) and
//! resolved once, at configuration time. Delivery goes through
//! [`send_signal`], which collapses the races inherent to signalling a
//! child that may have already exited.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Outcome of a signal delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was queued for the process.
    Delivered,

    /// The process no longer exists (or is no longer ours to signal).
    /// Carries the errno that revealed it.
    Gone(Errno),
}

/// Parse a signal name to the corresponding nix signal.
///
/// Accepts both `"TERM"` and `"SIGTERM"` spellings, case-insensitive.
///
/// # Errors
///
/// Returns an error if the signal name is not recognized.
pub fn parse_signal(name: &str) -> Result<Signal, InvalidSignal> {
    let upper = name.to_uppercase();
    let stripped = upper.strip_prefix("SIG").unwrap_or(&upper);

    match stripped {
        "TERM" => Ok(Signal::SIGTERM),
        "INT" => Ok(Signal::SIGINT),
        "QUIT" => Ok(Signal::SIGQUIT),
        "KILL" => Ok(Signal::SIGKILL),
        "HUP" => Ok(Signal::SIGHUP),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        "CONT" => Ok(Signal::SIGCONT),
        "WINCH" => Ok(Signal::SIGWINCH),
        _ => Err(InvalidSignal(name.to_string())),
    }
}

/// Deliver `sig` to `pid`, resolving exit races.
///
/// ESRCH and EPERM both mean the child we spawned is not there anymore
/// (EPERM implies the pid was recycled by another user after the exit),
/// so they are reported as [`Delivery::Gone`] rather than as errors.
///
/// # Errors
///
/// Any errno other than ESRCH/EPERM, which for a valid signal constant
/// should not occur in practice.
pub fn send_signal(pid: Pid, sig: Signal) -> Result<Delivery, Errno> {
    match signal::kill(pid, sig) {
        Ok(()) => Ok(Delivery::Delivered),
        Err(errno @ (Errno::ESRCH | Errno::EPERM)) => Ok(Delivery::Gone(errno)),
        Err(errno) => Err(errno),
    }
}

/// Unrecognized signal name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid signal name: {0}")]
pub struct InvalidSignal(pub String);
