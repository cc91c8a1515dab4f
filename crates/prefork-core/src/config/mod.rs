//! Supervisor configuration.
//!
//! All supervision tunables live in [`SupervisorConfig`]. Durations are
//! expressed as humantime strings ("2s", "500ms") in serialized form.
//! Signals are configured by name and resolved once, when the config is
//! validated into a [`KillPolicy`] snapshot; a bad name is a configuration
//! error, never a runtime one.

use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::heartbeat::HeartbeatPolicy;
use crate::signal::{parse_signal, InvalidSignal};

/// Configuration for the supervision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Target number of live workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Base stagger between worker starts. Zero disables staggering.
    #[serde(default = "default_start_worker_delay")]
    #[serde(with = "humantime_serde")]
    pub start_worker_delay: Duration,

    /// Relative jitter applied to the stagger, in `0.0..=1.0`.
    #[serde(default = "default_start_worker_delay_rand")]
    pub start_worker_delay_rand: f64,

    /// Cadence of the in-child heartbeat emitter.
    #[serde(default = "default_heartbeat_interval")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Idle threshold after which a silent worker is presumed dead and
    /// the immediate kill stage starts.
    #[serde(default = "default_heartbeat_timeout")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Signal sent during the graceful kill stage.
    #[serde(default = "default_graceful_kill_signal")]
    pub graceful_kill_signal: String,

    /// Signal sent during the immediate kill stage.
    #[serde(default = "default_immediate_kill_signal")]
    pub immediate_kill_signal: String,

    /// Signal delivered by reload requests.
    #[serde(default = "default_reload_signal")]
    pub reload_signal: String,

    /// Initial resend cadence in the graceful stage.
    #[serde(default = "default_kill_interval")]
    #[serde(with = "humantime_serde")]
    pub graceful_kill_interval: Duration,

    /// Linear backoff addend per resend in the graceful stage.
    #[serde(default = "default_kill_interval")]
    #[serde(with = "humantime_serde")]
    pub graceful_kill_interval_increment: Duration,

    /// When set, a graceful stop that has run this long escalates to the
    /// immediate stage. Absent means the graceful stage never times out.
    #[serde(default)]
    #[serde(with = "humantime_serde_opt")]
    pub graceful_kill_timeout: Option<Duration>,

    /// Initial resend cadence in the immediate stage.
    #[serde(default = "default_kill_interval")]
    #[serde(with = "humantime_serde")]
    pub immediate_kill_interval: Duration,

    /// Linear backoff addend per resend in the immediate stage.
    #[serde(default = "default_kill_interval")]
    #[serde(with = "humantime_serde")]
    pub immediate_kill_interval_increment: Duration,

    /// How long the immediate stage may run before escalating to SIGKILL.
    #[serde(default = "default_immediate_kill_timeout")]
    #[serde(with = "humantime_serde")]
    pub immediate_kill_timeout: Duration,

    /// Run the supervisor tick loop on a background thread.
    #[serde(default = "default_true")]
    pub auto_tick: bool,

    /// Cadence of the background tick loop.
    #[serde(default = "default_tick_interval")]
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Start the heartbeat emitter automatically inside each worker.
    #[serde(default = "default_true")]
    pub auto_heartbeat: bool,

    /// What a worker does when a heartbeat write fails. Not part of the
    /// serialized form; set programmatically.
    #[serde(skip)]
    pub on_heartbeat_error: HeartbeatPolicy,

    /// Which heartbeat pipe ends are marked close-on-exec.
    #[serde(default)]
    pub cloexec_mode: CloexecMode,
}

const fn default_workers() -> usize {
    1
}

const fn default_start_worker_delay() -> Duration {
    Duration::ZERO
}

const fn default_start_worker_delay_rand() -> f64 {
    0.2
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_graceful_kill_signal() -> String {
    "TERM".to_string()
}

fn default_immediate_kill_signal() -> String {
    "QUIT".to_string()
}

fn default_reload_signal() -> String {
    "USR2".to_string()
}

const fn default_kill_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_immediate_kill_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_true() -> bool {
    true
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            start_worker_delay: default_start_worker_delay(),
            start_worker_delay_rand: default_start_worker_delay_rand(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            graceful_kill_signal: default_graceful_kill_signal(),
            immediate_kill_signal: default_immediate_kill_signal(),
            reload_signal: default_reload_signal(),
            graceful_kill_interval: default_kill_interval(),
            graceful_kill_interval_increment: default_kill_interval(),
            graceful_kill_timeout: None,
            immediate_kill_interval: default_kill_interval(),
            immediate_kill_interval_increment: default_kill_interval(),
            immediate_kill_timeout: default_immediate_kill_timeout(),
            auto_tick: true,
            tick_interval: default_tick_interval(),
            auto_heartbeat: true,
            on_heartbeat_error: HeartbeatPolicy::default(),
            cloexec_mode: CloexecMode::default(),
        }
    }
}

impl SupervisorConfig {
    /// Check every tunable, rejecting values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// The first offending option found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("graceful_kill_interval", self.graceful_kill_interval),
            ("immediate_kill_interval", self.immediate_kill_interval),
            ("immediate_kill_timeout", self.immediate_kill_timeout),
            ("tick_interval", self.tick_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if let Some(timeout) = self.graceful_kill_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroDuration("graceful_kill_timeout"));
            }
        }
        if !(0.0..=1.0).contains(&self.start_worker_delay_rand) {
            return Err(ConfigError::JitterOutOfRange(self.start_worker_delay_rand));
        }
        self.kill_policy()?;
        Ok(())
    }

    /// Resolve the per-monitor tuning snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured signal name is unknown.
    pub fn kill_policy(&self) -> Result<KillPolicy, ConfigError> {
        Ok(KillPolicy {
            heartbeat_timeout: self.heartbeat_timeout,
            graceful_kill_signal: parse_signal(&self.graceful_kill_signal)?,
            immediate_kill_signal: parse_signal(&self.immediate_kill_signal)?,
            reload_signal: parse_signal(&self.reload_signal)?,
            graceful_kill_interval: self.graceful_kill_interval,
            graceful_kill_interval_increment: self.graceful_kill_interval_increment,
            graceful_kill_timeout: self.graceful_kill_timeout,
            immediate_kill_interval: self.immediate_kill_interval,
            immediate_kill_interval_increment: self.immediate_kill_interval_increment,
            immediate_kill_timeout: self.immediate_kill_timeout,
        })
    }
}

/// Immutable kill tuning handed to each monitor at spawn.
///
/// Snapshotting at spawn keeps ownership one-way: the manager owns the
/// monitors, and a monitor never reaches back into the manager.
#[derive(Debug, Clone)]
pub struct KillPolicy {
    /// Idle threshold that triggers the immediate stage.
    pub heartbeat_timeout: Duration,
    /// Signal for the graceful stage.
    pub graceful_kill_signal: Signal,
    /// Signal for the immediate stage.
    pub immediate_kill_signal: Signal,
    /// Signal delivered on reload.
    pub reload_signal: Signal,
    /// Initial graceful resend cadence.
    pub graceful_kill_interval: Duration,
    /// Graceful linear backoff addend.
    pub graceful_kill_interval_increment: Duration,
    /// Graceful stage deadline, absent when the stage never times out.
    pub graceful_kill_timeout: Option<Duration>,
    /// Initial immediate resend cadence.
    pub immediate_kill_interval: Duration,
    /// Immediate linear backoff addend.
    pub immediate_kill_interval_increment: Duration,
    /// Immediate stage deadline before SIGKILL.
    pub immediate_kill_timeout: Duration,
}

/// Which heartbeat pipe ends are marked close-on-exec.
///
/// Only relevant for workers that exec; a forked worker that never execs
/// keeps both ends either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloexecMode {
    /// Close-on-exec on the worker-side write end only.
    TargetOnly,

    /// Close-on-exec on the monitor-side read end only.
    MonitorOnly,

    /// Close-on-exec on both ends.
    #[default]
    Both,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Worker count of zero.
    #[error("workers must be at least 1")]
    NoWorkers,

    /// A duration option the engine divides time by was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Stagger jitter outside `0.0..=1.0`.
    #[error("start_worker_delay_rand must be within 0.0..=1.0, got {0}")]
    JitterOutOfRange(f64),

    /// Unknown signal name.
    #[error(transparent)]
    InvalidSignal(#[from] InvalidSignal),
}


mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_serde_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
