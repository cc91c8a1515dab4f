//! Worker-pool lifecycle scenarios: the keepalive loop maintaining a
//! pool across crashes, slot identity across restarts, and reload
//! delivery, all against real forked workers.

use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use prefork_core::config::SupervisorConfig;
use prefork_core::controller::MultiWorkerController;
use prefork_core::manager::ProcessManager;

fn pool_config(workers: usize) -> SupervisorConfig {
    SupervisorConfig {
        workers,
        tick_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(10),
        heartbeat_timeout: Duration::from_millis(5000),
        graceful_kill_interval: Duration::from_millis(30),
        graceful_kill_interval_increment: Duration::from_millis(30),
        immediate_kill_interval: Duration::from_millis(30),
        immediate_kill_interval_increment: Duration::from_millis(30),
        immediate_kill_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

fn wait_until<F>(condition: F, timeout: Duration, what: &str)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn pool_replaces_crashed_workers() {
    let config = pool_config(2);
    let manager = ProcessManager::new(config.clone()).unwrap();
    let controller = MultiWorkerController::new(&config).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            controller.run(|_worker_id| {
                manager.spawn(|_target| thread::sleep(Duration::from_secs(30)))
            });
        });

        wait_until(
            || controller.live_count() == 2,
            Duration::from_secs(10),
            "pool to fill",
        );

        // Shoot slot 0's worker behind the supervisor's back.
        let victim = controller.monitor(0).unwrap();
        let victim_id = victim.id();
        kill(victim.pid().unwrap(), Signal::SIGKILL).unwrap();

        // The slot refills under the same worker id with a new monitor.
        wait_until(
            || controller.restart_count(0) >= 1 && controller.live_count() == 2,
            Duration::from_secs(10),
            "slot 0 to be replaced",
        );
        let replacement = controller.monitor(0).unwrap();
        assert_ne!(replacement.id(), victim_id);
        assert!(replacement.is_alive());

        controller.stop(true);
        wait_until(
            || controller.live_count() == 0,
            Duration::from_secs(10),
            "pool to drain",
        );
    });

    manager.close();
}

#[test]
fn restart_keeps_worker_ids_across_resume() {
    let config = pool_config(2);
    let manager = ProcessManager::new(config.clone()).unwrap();
    let controller = MultiWorkerController::new(&config).unwrap();

    let start = |_worker_id: usize| {
        manager.spawn(|_target| thread::sleep(Duration::from_secs(30)))
    };

    thread::scope(|scope| {
        scope.spawn(|| controller.run(start));

        wait_until(
            || controller.live_count() == 2,
            Duration::from_secs(10),
            "pool to fill",
        );

        // restart drains the pool exactly like stop; run returns.
        controller.restart(true);
    });
    assert_eq!(controller.live_count(), 0);
    assert!(controller.is_stop_requested());

    // The outer lifecycle resumes and re-enters run: both worker ids
    // come back, with fresh monitors.
    controller.resume();
    thread::scope(|scope| {
        scope.spawn(|| controller.run(start));

        wait_until(
            || controller.live_count() == 2,
            Duration::from_secs(10),
            "pool to refill",
        );
        assert!(controller.monitor(0).is_some());
        assert!(controller.monitor(1).is_some());

        controller.stop(false);
    });

    manager.close();
}

#[test]
fn reload_leaves_prepared_workers_running() {
    let config = pool_config(1);
    let manager = ProcessManager::new(config.clone()).unwrap();
    let controller = MultiWorkerController::new(&config).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            controller.run(|_worker_id| {
                manager.spawn(|_target| {
                    // A real worker re-reads its configuration here; for
                    // the test it only has to survive the signal.
                    unsafe {
                        libc::signal(libc::SIGUSR2, libc::SIG_IGN);
                    }
                    thread::sleep(Duration::from_secs(30));
                })
            });
        });

        wait_until(
            || controller.live_count() == 1,
            Duration::from_secs(10),
            "pool to fill",
        );
        // Give the worker a moment to install its handler.
        thread::sleep(Duration::from_millis(100));

        controller.reload();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(controller.live_count(), 1);

        controller.stop(false);
    });

    manager.close();
}

#[test]
fn scale_down_drains_only_the_tail_slots() {
    let config = pool_config(3);
    let manager = ProcessManager::new(config.clone()).unwrap();
    let controller = MultiWorkerController::new(&config).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            controller.run(|_worker_id| {
                manager.spawn(|_target| thread::sleep(Duration::from_secs(30)))
            });
        });

        wait_until(
            || controller.live_count() == 3,
            Duration::from_secs(10),
            "pool to fill",
        );
        let survivor = controller.monitor(0).unwrap();

        controller.scale(1);
        wait_until(
            || controller.live_count() == 1,
            Duration::from_secs(10),
            "tail slots to drain",
        );
        assert!(survivor.is_alive());
        assert_eq!(controller.monitor(0).unwrap().id(), survivor.id());
        assert!(controller.monitor(1).is_none());
        assert!(controller.monitor(2).is_none());

        controller.stop(false);
    });

    manager.close();
}
