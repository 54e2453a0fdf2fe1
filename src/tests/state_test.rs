#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use nix::sys::signal::Signal;

    use crate::state::{Action, Observation, RestartPolicy, State, WatchState};
    use crate::watch::Watch;

    const INTERVAL: Duration = Duration::from_secs(1);

    fn watch(name: &str) -> Watch {
        Watch {
            id: 1,
            name: name.to_string(),
            start: vec!["/bin/sleep".to_string(), "3600".to_string()],
            stop: None,
            dir: None,
            uid: None,
            gid: None,
            pid_file: None,
            log_file: None,
            error_file: None,
            env: Default::default(),
            http_check: None,
            http_check_port: None,
            port_check: None,
            max_cpu: None,
            max_memory: None,
            stop_timeout: 5,
            startup_delay: 0,
        }
    }

    fn policy() -> RestartPolicy {
        RestartPolicy {
            window: Duration::from_secs(10),
            limit: 5,
        }
    }

    fn up() -> Observation {
        Observation {
            running: true,
            fault: None,
        }
    }

    fn gone() -> Observation {
        Observation {
            running: false,
            fault: None,
        }
    }

    fn running_state(watch: &Watch, pid: i32) -> State {
        let mut state = State::new(watch.id, &watch.name);
        state.request_start(Instant::now());
        state.pid = pid;
        state.handle_poll(watch, &up(), &policy(), INTERVAL, Instant::now());
        assert_eq!(state.current, WatchState::Running);
        state
    }

    #[test]
    fn test_start_request_spawns() {
        let mut state = State::new(1, "echo");

        let actions = state.request_start(Instant::now());

        assert_eq!(state.current, WatchState::Starting);
        assert!(actions.contains(&Action::Spawn));
    }

    #[test]
    fn test_start_is_noop_while_running() {
        let watch = watch("echo");
        let mut state = running_state(&watch, 42);

        let actions = state.request_start(Instant::now());

        assert!(actions.is_empty(), "start on a running watch must not act");
        assert_eq!(state.current, WatchState::Running);
    }

    #[test]
    fn test_startup_delay_defers_running() {
        let mut watch = watch("slow");
        watch.startup_delay = 3;

        let start = Instant::now();
        let mut state = State::new(watch.id, &watch.name);
        state.request_start(start);
        state.pid = 42;

        state.handle_poll(&watch, &up(), &policy(), INTERVAL, start + Duration::from_secs(1));
        assert_eq!(state.current, WatchState::Starting);

        state.handle_poll(&watch, &up(), &policy(), INTERVAL, start + Duration::from_secs(4));
        assert_eq!(state.current, WatchState::Running);
    }

    #[test]
    fn test_restart_storm_ends_failed() {
        let watch = watch("flappy");
        let mut state = running_state(&watch, 42);
        let now = Instant::now();

        // six exits within the window exhaust the budget of five
        for _ in 0..5 {
            state.pid = 42;
            state.handle_poll(&watch, &gone(), &policy(), INTERVAL, now);
            assert_eq!(state.current, WatchState::Starting);
        }

        state.pid = 42;
        state.handle_poll(&watch, &gone(), &policy(), INTERVAL, now);

        assert_eq!(state.current, WatchState::Failed);
    }

    #[test]
    fn test_stability_resets_restart_window() {
        let watch = watch("recovers");
        let mut state = running_state(&watch, 42);
        let now = Instant::now();

        for _ in 0..4 {
            state.pid = 42;
            state.handle_poll(&watch, &gone(), &policy(), INTERVAL, now);
            assert_eq!(state.current, WatchState::Starting);
        }

        state.pid = 42;
        state.handle_poll(&watch, &up(), &policy(), INTERVAL, now);
        assert_eq!(state.current, WatchState::Running);

        // eleven seconds later the window is clear again
        let later = now + Duration::from_secs(11);
        assert_eq!(state.restarts_in_window(later, policy().window), 0);

        state.handle_poll(&watch, &gone(), &policy(), INTERVAL, later);
        assert_eq!(state.current, WatchState::Starting);
        assert_eq!(state.restarts_in_window(later, policy().window), 1);
    }

    #[test]
    fn test_stop_sends_sigterm_then_escalates_once() {
        let watch = watch("stubborn");
        let mut state = running_state(&watch, 42);
        let now = Instant::now();

        let actions = state.request_stop(&watch, now);
        assert_eq!(state.current, WatchState::Stopping);
        assert!(actions.contains(&Action::Signal {
            pid: 42,
            signal: Signal::SIGTERM
        }));

        // a repeated stop does not signal again
        let repeated = state.request_stop(&watch, now);
        assert!(repeated.is_empty());

        // past the timeout the escalation fires exactly once
        let late = now + Duration::from_secs(watch.stop_timeout + 1);
        let actions = state.handle_poll(&watch, &up(), &policy(), INTERVAL, late);
        let kills = actions
            .iter()
            .filter(|action| {
                matches!(
                    action,
                    Action::Signal {
                        signal: Signal::SIGKILL,
                        ..
                    }
                )
            })
            .count();

        assert_eq!(kills, 1);
        assert_eq!(state.current, WatchState::Unmonitored);
        assert_eq!(state.pid, 0);
    }

    #[test]
    fn test_stop_timeout_zero_kills_immediately() {
        let mut watch = watch("nokill");
        watch.stop_timeout = 0;

        let mut state = running_state(&watch, 42);
        let actions = state.request_stop(&watch, Instant::now());

        assert!(actions.contains(&Action::Signal {
            pid: 42,
            signal: Signal::SIGTERM
        }));
        assert!(actions.contains(&Action::Signal {
            pid: 42,
            signal: Signal::SIGKILL
        }));
    }

    #[test]
    fn test_stop_while_starting_is_queued() {
        let watch = watch("early");
        let mut state = State::new(watch.id, &watch.name);
        let now = Instant::now();

        state.request_start(now);
        let actions = state.request_stop(&watch, now);

        // no PID yet, nothing to signal
        assert!(actions.is_empty());
        assert_eq!(state.current, WatchState::Starting);

        // once the PID shows up the stop is honored
        state.pid = 42;
        let actions = state.handle_poll(&watch, &up(), &policy(), INTERVAL, now);

        assert_eq!(state.current, WatchState::Stopping);
        assert!(actions.contains(&Action::Signal {
            pid: 42,
            signal: Signal::SIGTERM
        }));
    }

    #[test]
    fn test_custom_stop_command_is_used() {
        let mut watch = watch("custom");
        watch.stop = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "kill $NYX_PID".to_string(),
        ]);

        let mut state = running_state(&watch, 42);
        let actions = state.request_stop(&watch, Instant::now());

        assert!(actions.contains(&Action::StopCommand { pid: 42 }));
        assert!(!actions
            .iter()
            .any(|action| matches!(action, Action::Signal { .. })));
    }

    #[test]
    fn test_stopped_process_goes_unmonitored() {
        let watch = watch("clean");
        let mut state = running_state(&watch, 42);
        let now = Instant::now();

        state.request_stop(&watch, now);
        let actions = state.handle_poll(&watch, &gone(), &policy(), INTERVAL, now);

        assert_eq!(state.current, WatchState::Unmonitored);
        assert_eq!(state.pid, 0);
        assert!(actions.contains(&Action::RemovePidFile));
    }

    #[test]
    fn test_fault_restarts_the_watch() {
        let watch = watch("greedy");
        let mut state = running_state(&watch, 42);
        let now = Instant::now();

        let hot = Observation {
            running: true,
            fault: Some("cpu usage 140.0% exceeds limit of 50%".to_string()),
        };

        state.handle_poll(&watch, &hot, &policy(), INTERVAL, now);
        assert_eq!(state.current, WatchState::Stopping);

        // once the process is gone it comes straight back
        let actions = state.handle_poll(&watch, &gone(), &policy(), INTERVAL, now);
        assert_eq!(state.current, WatchState::Starting);
        assert!(actions.contains(&Action::Spawn));
    }

    #[test]
    fn test_persistent_fault_exhausts_restart_budget() {
        let watch = watch("leaky");
        let mut state = running_state(&watch, 42);
        let now = Instant::now();

        let hot = Observation {
            running: true,
            fault: Some("memory usage of 2048 bytes exceeds limit of 1024".to_string()),
        };

        for _ in 0..5 {
            state.handle_poll(&watch, &hot, &policy(), INTERVAL, now);
            assert_eq!(state.current, WatchState::Stopping);

            state.handle_poll(&watch, &gone(), &policy(), INTERVAL, now);
            assert_eq!(state.current, WatchState::Starting);

            state.pid = 42;
            state.handle_poll(&watch, &up(), &policy(), INTERVAL, now);
            assert_eq!(state.current, WatchState::Running);
        }

        // the sixth violation within the window trips the budget
        state.handle_poll(&watch, &hot, &policy(), INTERVAL, now);
        state.handle_poll(&watch, &gone(), &policy(), INTERVAL, now);

        assert_eq!(state.current, WatchState::Failed);
    }

    #[test]
    fn test_starting_without_pid_times_out() {
        let watch = watch("absent");
        let mut state = State::new(watch.id, &watch.name);
        let start = Instant::now();

        state.request_start(start);

        // grace is startup_delay plus two intervals
        state.handle_poll(&watch, &gone(), &policy(), INTERVAL, start + Duration::from_secs(1));
        assert_eq!(state.current, WatchState::Starting);

        state.handle_poll(&watch, &gone(), &policy(), INTERVAL, start + Duration::from_secs(3));
        assert_eq!(state.current, WatchState::Failed);
    }

    #[test]
    fn test_removed_watch_does_not_respawn() {
        let watch = watch("legacy");
        let mut state = running_state(&watch, 42);
        state.removed = true;

        let actions = state.handle_poll(&watch, &gone(), &policy(), INTERVAL, Instant::now());

        assert_eq!(state.current, WatchState::Unmonitored);
        assert!(!actions.contains(&Action::Spawn));
        assert!(state.is_quiescent());
    }

    #[test]
    fn test_restart_request_respawns_after_stop() {
        let watch = watch("reloaded");
        let mut state = running_state(&watch, 42);
        let now = Instant::now();

        let actions = state.request_restart(&watch, now);
        assert_eq!(state.current, WatchState::Stopping);
        assert!(actions.contains(&Action::Signal {
            pid: 42,
            signal: Signal::SIGTERM
        }));

        let actions = state.handle_poll(&watch, &gone(), &policy(), INTERVAL, now);
        assert_eq!(state.current, WatchState::Starting);
        assert!(actions.contains(&Action::Spawn));
    }
}
