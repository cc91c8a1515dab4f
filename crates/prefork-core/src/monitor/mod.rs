//! Per-worker health tracking and the staged kill protocol.
//!
//! A [`Monitor`] is the parent-side record of one worker child: its pid,
//! the instant of its most recent heartbeat, and the kill state machine
//! that walks an unresponsive child through graceful signal, immediate
//! signal, and finally SIGKILL.
//!
//! Stage progression is one-way. Within a stage, the signal is resent on
//! a linear backoff: the k-th resend waits `interval + k × increment`.
//! Escalation to the immediate stage happens on explicit request, on
//! heartbeat timeout, or when a graceful deadline is configured and
//! exceeded; a silent worker is presumed dead whether or not anyone asked
//! for a shutdown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::KillPolicy;
use crate::signal::{send_signal, Delivery};

/// Terminal status of a reaped worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker exited on its own.
    Exited {
        /// Exit code.
        code: i32,
    },

    /// The worker was terminated by a signal.
    Signaled {
        /// The terminating signal.
        signal: Signal,
        /// Whether a core dump was produced.
        core_dumped: bool,
    },

    /// The worker vanished before it could be reaped; carries the errno
    /// (ECHILD/ESRCH/EPERM) that revealed it.
    Lost {
        /// The errno observed during reap or signal delivery.
        errno: Errno,
    },
}

impl WorkerExit {
    /// Returns `true` for a clean zero-status exit.
    #[must_use]
    pub const fn clean(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited (code: {code})"),
            Self::Signaled {
                signal,
                core_dumped: true,
            } => write!(f, "killed by {signal} (core dumped)"),
            Self::Signaled { signal, .. } => write!(f, "killed by {signal}"),
            Self::Lost { errno } => write!(f, "lost ({errno})"),
        }
    }
}

/// Outcome of a reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    /// The worker has been collected; the status is recorded on the
    /// monitor as well.
    Exited(WorkerExit),

    /// The worker is still running.
    StillRunning,

    /// The worker was already collected earlier.
    AlreadyReaped,
}

/// Kill protocol stage, derived from the monitor's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStage {
    /// Healthy, no shutdown in progress.
    Running,
    /// Graceful signal being resent on backoff.
    GracefulKill,
    /// Immediate signal being resent on backoff.
    ImmediateKill,
    /// SIGKILL being resent until the reap succeeds.
    ForceKill,
    /// The worker has been reaped.
    Terminal,
}

impl fmt::Display for KillStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::GracefulKill => write!(f, "graceful_kill"),
            Self::ImmediateKill => write!(f, "immediate_kill"),
            Self::ForceKill => write!(f, "force_kill"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Parent-side record of one worker child.
///
/// Cheaply cloneable; all clones observe the same worker. Liveness reads
/// are a single atomic load, everything else is serialized behind one
/// small mutex.
#[derive(Debug, Clone)]
pub struct Monitor {
    shared: Arc<MonitorShared>,
}

#[derive(Debug)]
struct MonitorShared {
    id: Uuid,
    started_at: DateTime<Utc>,
    alive: AtomicBool,
    policy: KillPolicy,
    state: Mutex<KillState>,
}

#[derive(Debug)]
struct KillState {
    pid: Option<Pid>,
    last_heartbeat_at: Instant,
    next_kill_at: Option<Instant>,
    graceful_kill_started_at: Option<Instant>,
    immediate_kill_started_at: Option<Instant>,
    kill_count: u32,
    exit: Option<WorkerExit>,
}

impl KillState {
    /// Request the graceful stage. Timestamps already set are never
    /// moved, which is what makes repeated stop requests idempotent.
    fn enter_graceful(&mut self, now: Instant) {
        if self.graceful_kill_started_at.is_none() {
            self.graceful_kill_started_at = Some(now);
        }
        if self.next_kill_at.is_none() {
            self.next_kill_at = Some(now);
        }
    }

    /// Enter the immediate stage: reset the resend counter and pull the
    /// next send forward so the first immediate signal goes out promptly.
    fn enter_immediate(&mut self, now: Instant) {
        if self.immediate_kill_started_at.is_none() {
            self.immediate_kill_started_at = Some(now);
            self.kill_count = 0;
            self.next_kill_at = Some(now);
        }
    }
}

impl Monitor {
    pub(crate) fn new(pid: Pid, policy: KillPolicy, now: Instant) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                id: Uuid::new_v4(),
                started_at: Utc::now(),
                alive: AtomicBool::new(true),
                policy,
                state: Mutex::new(KillState {
                    pid: Some(pid),
                    last_heartbeat_at: now,
                    next_kill_at: None,
                    graceful_kill_started_at: None,
                    immediate_kill_started_at: None,
                    kill_count: 0,
                    exit: None,
                }),
            }),
        }
    }

    /// Unique id of this spawn, for log correlation.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Wall-clock time the worker was spawned.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// Lock-free liveness read: `true` until the worker has been reaped
    /// or observed gone.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// The worker's pid, absent once reaped.
    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.shared.state.lock().unwrap().pid
    }

    /// Recorded terminal status, if the worker has been reaped.
    #[must_use]
    pub fn exit_status(&self) -> Option<WorkerExit> {
        self.shared.state.lock().unwrap().exit
    }

    /// Time since the most recent heartbeat.
    #[must_use]
    pub fn heartbeat_delay(&self, now: Instant) -> Duration {
        now.duration_since(self.shared.state.lock().unwrap().last_heartbeat_at)
    }

    /// Current kill stage.
    #[must_use]
    pub fn stage(&self) -> KillStage {
        let st = self.shared.state.lock().unwrap();
        if st.pid.is_none() {
            return KillStage::Terminal;
        }
        match st.immediate_kill_started_at {
            Some(started)
                if Instant::now().duration_since(started)
                    >= self.shared.policy.immediate_kill_timeout =>
            {
                KillStage::ForceKill
            }
            Some(_) => KillStage::ImmediateKill,
            None if st.graceful_kill_started_at.is_some() => KillStage::GracefulKill,
            None => KillStage::Running,
        }
    }

    /// Request a stop: graceful starts (or keeps) the graceful stage,
    /// non-graceful jumps straight to the immediate stage. Idempotent.
    pub fn send_stop(&self, graceful: bool) {
        let now = Instant::now();
        let mut st = self.shared.state.lock().unwrap();
        if st.pid.is_none() {
            return;
        }
        if graceful {
            st.enter_graceful(now);
        } else {
            st.enter_immediate(now);
        }
    }

    /// Immediate stop at an externally captured clock sample, so the
    /// manager can evict a pipe and advance this monitor within the same
    /// tick iteration.
    pub(crate) fn start_immediate_stop(&self, now: Instant) {
        let mut st = self.shared.state.lock().unwrap();
        if st.pid.is_some() {
            st.enter_immediate(now);
        }
    }

    /// Deliver the reload signal, best-effort. Errors are swallowed: a
    /// worker that cannot receive a reload is either already dying or
    /// about to be noticed by the kill protocol.
    pub fn send_reload(&self) {
        let st = self.shared.state.lock().unwrap();
        if let Some(pid) = st.pid {
            match send_signal(pid, self.shared.policy.reload_signal) {
                Ok(Delivery::Delivered) => {}
                Ok(Delivery::Gone(errno)) => {
                    debug!(monitor = %self.shared.id, %pid, %errno, "reload target already gone");
                }
                Err(errno) => {
                    debug!(monitor = %self.shared.id, %pid, %errno, "reload delivery failed");
                }
            }
        }
    }

    /// Non-blocking reap.
    pub fn try_join(&self) -> Reaped {
        let mut st = self.shared.state.lock().unwrap();
        let Some(pid) = st.pid else {
            return Reaped::AlreadyReaped;
        };
        self.reap_locked(&mut st, pid, Some(WaitPidFlag::WNOHANG))
    }

    /// Blocking reap. Returns once the worker has been collected (by
    /// this call or an earlier one).
    pub fn join(&self) -> Reaped {
        loop {
            let mut st = self.shared.state.lock().unwrap();
            let Some(pid) = st.pid else {
                return Reaped::AlreadyReaped;
            };
            match self.reap_locked(&mut st, pid, None) {
                // Only EINTR lands here for a blocking wait; retry.
                Reaped::StillRunning => continue,
                done => return done,
            }
        }
    }

    pub(crate) fn record_heartbeat(&self, now: Instant) {
        self.shared.state.lock().unwrap().last_heartbeat_at = now;
    }

    /// One supervision step at the shared per-iteration clock sample.
    ///
    /// Returns `false` once the pid has been cleared; the manager drops
    /// the monitor from its set at that point.
    pub(crate) fn tick(&self, now: Instant) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        let Some(pid) = st.pid else {
            self.shared.alive.store(false, Ordering::Release);
            return false;
        };

        let policy = &self.shared.policy;

        // Heartbeat escalation applies whether or not a shutdown was
        // requested: a silent worker is presumed dead.
        let heartbeat_delay = now.duration_since(st.last_heartbeat_at);
        if heartbeat_delay >= policy.heartbeat_timeout && st.immediate_kill_started_at.is_none() {
            warn!(
                monitor = %self.shared.id,
                %pid,
                delay = ?heartbeat_delay,
                "heartbeat timeout, starting immediate stop"
            );
            st.enter_immediate(now);
        }

        if let (Some(started), Some(deadline)) =
            (st.graceful_kill_started_at, policy.graceful_kill_timeout)
        {
            if st.immediate_kill_started_at.is_none()
                && now.duration_since(started) >= deadline
            {
                debug!(monitor = %self.shared.id, %pid, "graceful stop timed out, escalating");
                st.enter_immediate(now);
            }
        }

        let Some(next_kill_at) = st.next_kill_at else {
            return true;
        };
        if now < next_kill_at {
            return true;
        }

        // Reap before signalling: a zombie accepts signals indefinitely,
        // so the exit has to be collected here when no controller is
        // polling `try_join` for us.
        match self.reap_locked(&mut st, pid, Some(WaitPidFlag::WNOHANG)) {
            Reaped::StillRunning => {}
            _ => return false,
        }

        let (sig, interval, increment) = if let Some(started) = st.immediate_kill_started_at {
            let sig = if now.duration_since(started) >= policy.immediate_kill_timeout {
                Signal::SIGKILL
            } else {
                policy.immediate_kill_signal
            };
            (
                sig,
                policy.immediate_kill_interval,
                policy.immediate_kill_interval_increment,
            )
        } else {
            (
                policy.graceful_kill_signal,
                policy.graceful_kill_interval,
                policy.graceful_kill_interval_increment,
            )
        };

        match send_signal(pid, sig) {
            Ok(Delivery::Delivered) => {
                debug!(
                    monitor = %self.shared.id,
                    %pid,
                    signal = %sig,
                    kill_count = st.kill_count,
                    "sent kill signal"
                );
                st.next_kill_at = Some(now + interval + increment * st.kill_count);
                st.kill_count += 1;
                true
            }
            Ok(Delivery::Gone(errno)) => {
                self.finish(&mut st, WorkerExit::Lost { errno });
                false
            }
            Err(errno) => {
                // Should not happen for a validated signal; keep the
                // monitor and retry on the normal cadence.
                warn!(monitor = %self.shared.id, %pid, %errno, "kill failed");
                st.next_kill_at = Some(now + interval);
                true
            }
        }
    }

    fn reap_locked(&self, st: &mut KillState, pid: Pid, flag: Option<WaitPidFlag>) -> Reaped {
        match waitpid(pid, flag) {
            Ok(WaitStatus::StillAlive) => Reaped::StillRunning,
            Ok(WaitStatus::Exited(_, code)) => self.finish(st, WorkerExit::Exited { code }),
            Ok(WaitStatus::Signaled(_, signal, core_dumped)) => self.finish(
                st,
                WorkerExit::Signaled {
                    signal,
                    core_dumped,
                },
            ),
            // Stop/continue events are not exits.
            Ok(_) => Reaped::StillRunning,
            Err(Errno::EINTR) => Reaped::StillRunning,
            Err(errno) => self.finish(st, WorkerExit::Lost { errno }),
        }
    }

    fn finish(&self, st: &mut KillState, exit: WorkerExit) -> Reaped {
        st.pid = None;
        st.next_kill_at = None;
        let exit = *st.exit.get_or_insert(exit);
        self.shared.alive.store(false, Ordering::Release);
        if exit.clean() {
            info!(monitor = %self.shared.id, %exit, "worker finished");
        } else {
            warn!(monitor = %self.shared.id, %exit, "worker finished");
        }
        Reaped::Exited(exit)
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};
    use std::thread;

    use super::*;
    use crate::config::SupervisorConfig;

    fn test_policy() -> KillPolicy {
        let config = SupervisorConfig {
            heartbeat_timeout: Duration::from_millis(100),
            graceful_kill_interval: Duration::from_millis(10),
            graceful_kill_interval_increment: Duration::from_millis(10),
            immediate_kill_interval: Duration::from_millis(10),
            immediate_kill_interval_increment: Duration::from_millis(10),
            immediate_kill_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        config.kill_policy().unwrap()
    }

    /// A child that ignores TERM and QUIT, to exercise resends and
    /// escalation. Ignored dispositions survive the exec.
    fn spawn_stubborn() -> (Child, Pid) {
        let child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM QUIT; exec sleep 30")
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        // Give the shell a moment to install the traps before exec.
        thread::sleep(Duration::from_millis(50));
        (child, pid)
    }

    fn force_kill(monitor: &Monitor, pid: Pid) {
        let _ = send_signal(pid, Signal::SIGKILL);
        monitor.join();
    }

    #[test]
    fn test_fresh_monitor_is_alive_and_running() {
        let (_child, pid) = spawn_stubborn();
        let monitor = Monitor::new(pid, test_policy(), Instant::now());

        assert!(monitor.is_alive());
        assert_eq!(monitor.stage(), KillStage::Running);
        assert_eq!(monitor.pid(), Some(pid));
        assert_eq!(monitor.try_join(), Reaped::StillRunning);

        force_kill(&monitor, pid);
        assert!(!monitor.is_alive());
        assert_eq!(monitor.stage(), KillStage::Terminal);
    }

    #[test]
    fn test_kill_schedule_linear_backoff() {
        let (_child, pid) = spawn_stubborn();
        let monitor = Monitor::new(pid, test_policy(), Instant::now());

        monitor.send_stop(true);
        let t0 = monitor.shared.state.lock().unwrap().next_kill_at.unwrap();

        // First send at t0, then gaps of interval + k * increment.
        assert!(monitor.tick(t0));
        {
            let st = monitor.shared.state.lock().unwrap();
            assert_eq!(st.kill_count, 1);
            assert_eq!(st.next_kill_at, Some(t0 + Duration::from_millis(10)));
        }

        // Not due yet: nothing moves.
        assert!(monitor.tick(t0 + Duration::from_millis(5)));
        assert_eq!(monitor.shared.state.lock().unwrap().kill_count, 1);

        let t1 = t0 + Duration::from_millis(10);
        assert!(monitor.tick(t1));
        {
            let st = monitor.shared.state.lock().unwrap();
            assert_eq!(st.kill_count, 2);
            assert_eq!(st.next_kill_at, Some(t1 + Duration::from_millis(20)));
        }

        force_kill(&monitor, pid);
    }

    #[test]
    fn test_stop_requests_are_idempotent() {
        let (_child, pid) = spawn_stubborn();
        let monitor = Monitor::new(pid, test_policy(), Instant::now());

        monitor.send_stop(true);
        let first = monitor.shared.state.lock().unwrap().graceful_kill_started_at;
        thread::sleep(Duration::from_millis(5));
        monitor.send_stop(true);
        let second = monitor.shared.state.lock().unwrap().graceful_kill_started_at;
        assert_eq!(first, second);

        monitor.send_stop(false);
        let first = monitor.shared.state.lock().unwrap().immediate_kill_started_at;
        thread::sleep(Duration::from_millis(5));
        monitor.send_stop(false);
        let second = monitor.shared.state.lock().unwrap().immediate_kill_started_at;
        assert_eq!(first, second);

        force_kill(&monitor, pid);
    }

    #[test]
    fn test_immediate_entry_resets_kill_count() {
        let (_child, pid) = spawn_stubborn();
        let monitor = Monitor::new(pid, test_policy(), Instant::now());

        monitor.send_stop(true);
        let t0 = monitor.shared.state.lock().unwrap().next_kill_at.unwrap();
        assert!(monitor.tick(t0));
        assert!(monitor.tick(t0 + Duration::from_millis(10)));
        assert_eq!(monitor.shared.state.lock().unwrap().kill_count, 2);

        monitor.send_stop(false);
        {
            let st = monitor.shared.state.lock().unwrap();
            assert_eq!(st.kill_count, 0);
            assert!(st.immediate_kill_started_at.is_some());
        }
        assert_eq!(monitor.stage(), KillStage::ImmediateKill);

        force_kill(&monitor, pid);
    }

    #[test]
    fn test_heartbeat_timeout_escalates_without_stop_request() {
        let (_child, pid) = spawn_stubborn();
        let t0 = Instant::now();
        let monitor = Monitor::new(pid, test_policy(), t0);

        // Under the threshold: nothing happens.
        assert!(monitor.tick(t0 + Duration::from_millis(99)));
        assert!(monitor
            .shared
            .state
            .lock()
            .unwrap()
            .immediate_kill_started_at
            .is_none());

        // Over the threshold: immediate stage starts.
        assert!(monitor.tick(t0 + Duration::from_millis(100)));
        assert!(monitor
            .shared
            .state
            .lock()
            .unwrap()
            .immediate_kill_started_at
            .is_some());

        force_kill(&monitor, pid);
    }

    #[test]
    fn test_heartbeat_refresh_prevents_escalation() {
        let (_child, pid) = spawn_stubborn();
        let t0 = Instant::now();
        let monitor = Monitor::new(pid, test_policy(), t0);

        let t1 = t0 + Duration::from_millis(90);
        monitor.record_heartbeat(t1);
        assert!(monitor.tick(t1 + Duration::from_millis(99)));
        assert!(monitor
            .shared
            .state
            .lock()
            .unwrap()
            .immediate_kill_started_at
            .is_none());

        force_kill(&monitor, pid);
    }

    #[test]
    fn test_graceful_deadline_escalates() {
        let (_child, pid) = spawn_stubborn();
        let mut policy = test_policy();
        policy.graceful_kill_timeout = Some(Duration::from_millis(50));
        let monitor = Monitor::new(pid, policy, Instant::now());

        monitor.send_stop(true);
        let t0 = monitor.shared.state.lock().unwrap().next_kill_at.unwrap();
        assert!(monitor.tick(t0));
        assert_eq!(monitor.stage(), KillStage::GracefulKill);

        assert!(monitor.tick(t0 + Duration::from_millis(50)));
        {
            let st = monitor.shared.state.lock().unwrap();
            assert!(st.immediate_kill_started_at.is_some());
            assert_eq!(st.kill_count, 1);
        }

        force_kill(&monitor, pid);
    }

    #[test]
    fn test_force_kill_reaps_stubborn_worker() {
        let (_child, pid) = spawn_stubborn();
        let monitor = Monitor::new(pid, test_policy(), Instant::now());

        monitor.send_stop(false);
        let t0 = monitor.shared.state.lock().unwrap().next_kill_at.unwrap();
        // QUIT is ignored by the child.
        assert!(monitor.tick(t0));

        // Past the immediate timeout the stage signal becomes SIGKILL.
        let t_force = t0 + Duration::from_millis(200);
        assert!(monitor.tick(t_force));

        // Give the kernel a moment, then the next due tick collects it.
        thread::sleep(Duration::from_millis(50));
        assert!(!monitor.tick(t_force + Duration::from_millis(20)));
        assert!(!monitor.is_alive());
        assert_eq!(
            monitor.exit_status(),
            Some(WorkerExit::Signaled {
                signal: Signal::SIGKILL,
                core_dumped: false
            })
        );
    }

    #[test]
    fn test_try_join_collects_exit_status() {
        let child = Command::new("sh").arg("-c").arg("exit 7").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let monitor = Monitor::new(pid, test_policy(), Instant::now());

        // Wait for the child to exit, then reap through the monitor.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(
            monitor.try_join(),
            Reaped::Exited(WorkerExit::Exited { code: 7 })
        );
        assert_eq!(monitor.try_join(), Reaped::AlreadyReaped);
        assert!(!monitor.is_alive());
        assert_eq!(monitor.pid(), None);
    }

    #[test]
    fn test_reap_race_collapses_to_lost() {
        // A pid that was never our child: waitpid reports ECHILD, which
        // the monitor records as a lost worker rather than an error.
        let monitor = Monitor::new(Pid::from_raw(1), test_policy(), Instant::now());

        match monitor.try_join() {
            Reaped::Exited(WorkerExit::Lost { errno }) => assert_eq!(errno, Errno::ECHILD),
            other => panic!("expected lost worker, got {other:?}"),
        }
        assert!(!monitor.is_alive());
    }

    #[test]
    fn test_join_blocks_until_exit() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("sleep 0.1; exit 3")
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let monitor = Monitor::new(pid, test_policy(), Instant::now());

        assert_eq!(
            monitor.join(),
            Reaped::Exited(WorkerExit::Exited { code: 3 })
        );
        assert_eq!(monitor.join(), Reaped::AlreadyReaped);
    }
}
