#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::watch::Watch;

    fn watch(name: &str) -> Watch {
        Watch {
            id: 1,
            name: name.to_string(),
            start: vec!["/usr/local/bin/my-daemon".to_string(), "-f".to_string()],
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
    fn test_executable_is_the_basename() {
        assert_eq!(watch("svc").executable(), "my-daemon");

        let mut bare = watch("svc");
        bare.start = vec!["redis-server".to_string()];
        assert_eq!(bare.executable(), "redis-server");
    }

    #[test]
    fn test_comm_matching_honors_kernel_truncation() {
        let mut long = watch("svc");
        long.start = vec!["/opt/bin/a-very-long-daemon-name".to_string()];

        // the kernel only keeps the first 15 characters
        assert!(long.matches_comm("a-very-long-dae"));
        assert!(long.matches_comm("a-very-long-daemon-name"));
        assert!(!long.matches_comm("something-else"));
    }

    #[test]
    fn test_validation_accepts_a_plain_watch() {
        assert!(watch("svc").validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_name() {
        assert!(watch("").validate().is_err());
    }

    #[test]
    fn test_validation_rejects_missing_start() {
        let mut broken = watch("svc");
        broken.start = vec![];
        assert!(broken.validate().is_err());

        broken.start = vec!["".to_string()];
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_stop_command() {
        let mut broken = watch("svc");
        broken.stop = Some(vec![]);
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_validation_requires_port_for_http_check() {
        let mut broken = watch("svc");
        broken.http_check = Some("/health".to_string());
        assert!(broken.validate().is_err());

        broken.http_check_port = Some(8080);
        assert!(broken.validate().is_ok());
    }

    #[test]
    fn test_same_spec_ignores_the_generation_id() {
        let one = watch("svc");
        let mut two = watch("svc");
        two.id = 9;

        assert!(one.same_spec(&two));

        two.env.insert("MODE".to_string(), "fast".to_string());
        assert!(!one.same_spec(&two));
    }
}
