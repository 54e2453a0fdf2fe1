#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::process::Command;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::process;
    use crate::watch::Watch;

    fn sleep_watch() -> Watch {
        Watch {
            id: 1,
            name: "sleeper".to_string(),
            start: vec!["/bin/sleep".to_string(), "30".to_string()],
            stop: None,
            dir: None,
            uid: None,
            gid: None,
            pid_file: None,
            log_file: None,
            error_file: None,
            env: HashMap::new(),
            http_check: None,
            http_check_port: None,
            port_check: None,
            max_cpu: None,
            max_memory: None,
            stop_timeout: 5,
            startup_delay: 0,
        }
    }

    #[test]
    fn test_own_process_is_running() {
        let pid = std::process::id() as i32;
        assert!(process::check_process_running(pid));
    }

    #[test]
    fn test_bogus_pid_is_not_running() {
        assert!(!process::check_process_running(0));
        assert!(!process::check_process_running(-1));
        assert!(!process::check_process_running(i32::MAX));
    }

    #[test]
    fn test_spawned_process_is_tracked_and_adoptable() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id() as i32;

        assert!(process::check_process_running(pid), "Process should be running");

        // comm matching is what PID adoption relies on
        assert_eq!(process::process_comm(pid).as_deref(), Some("sleep"));
        assert!(process::adoptable(pid, &sleep_watch()));

        child.kill().expect("Failed to kill process");
        child.wait().expect("Failed to wait for process");

        let start_time = Instant::now();
        while process::check_process_running(pid)
            && start_time.elapsed() < Duration::from_secs(5)
        {
            thread::sleep(Duration::from_millis(100));
        }

        assert!(
            !process::check_process_running(pid),
            "Process should not be running"
        );
    }

    #[test]
    fn test_adoption_rejects_wrong_executable() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id() as i32;

        let mut watch = sleep_watch();
        watch.start = vec!["/usr/bin/some-other-daemon".to_string()];

        assert!(!process::adoptable(pid, &watch));

        child.kill().expect("Failed to kill process");
        child.wait().expect("Failed to wait for process");
    }

    #[test]
    fn test_resource_usage_of_self() {
        let pid = std::process::id() as i32;
        let usage = process::resource_usage(pid).expect("Failed to read resource usage");

        assert!(usage.memory_bytes > 0);
        assert!(usage.cpu_percent >= 0.0);
    }
}
