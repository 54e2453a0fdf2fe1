#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::plugins::{Plugin, PluginRepository};
    use crate::state::WatchState;

    struct Recorder {
        tag: &'static str,
        events: Arc<Mutex<Vec<String>>>,
        destroyed: Arc<AtomicBool>,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.tag
        }

        fn on_state_change(&self, watch: &str, state: WatchState, pid: i32) {
            self.events
                .lock()
                .expect("Failed to lock event log")
                .push(format!("{}:{}:{}:{}", self.tag, watch, state, pid));
        }

        fn on_destroy(&self) {
            self.destroyed.store(true, Ordering::Relaxed);
        }
    }

    struct Panicker;

    impl Plugin for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        fn on_state_change(&self, _watch: &str, _state: WatchState, _pid: i32) {
            panic!("misbehaving plugin");
        }
    }

    fn recorder(
        tag: &'static str,
        events: &Arc<Mutex<Vec<String>>>,
        destroyed: &Arc<AtomicBool>,
    ) -> Box<Recorder> {
        Box::new(Recorder {
            tag,
            events: events.clone(),
            destroyed: destroyed.clone(),
        })
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let destroyed = Arc::new(AtomicBool::new(false));

        let mut repo = PluginRepository::new();
        repo.register(recorder("first", &events, &destroyed));
        repo.register(recorder("second", &events, &destroyed));

        repo.notify_state_change("web", WatchState::Running, 42);

        let seen = events.lock().expect("Failed to lock event log");
        assert_eq!(
            *seen,
            vec![
                "first:web:running:42".to_string(),
                "second:web:running:42".to_string()
            ]
        );
    }

    #[test]
    fn test_panicking_plugin_does_not_disturb_others() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let destroyed = Arc::new(AtomicBool::new(false));

        let mut repo = PluginRepository::new();
        repo.register(Box::new(Panicker));
        repo.register(recorder("survivor", &events, &destroyed));

        repo.notify_state_change("db", WatchState::Failed, 0);

        let seen = events.lock().expect("Failed to lock event log");
        assert_eq!(*seen, vec!["survivor:db:failed:0".to_string()]);
    }

    #[test]
    fn test_destroy_reaches_every_plugin() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let destroyed = Arc::new(AtomicBool::new(false));

        let mut repo = PluginRepository::new();
        repo.register(recorder("only", &events, &destroyed));

        repo.destroy_all();

        assert!(destroyed.load(Ordering::Relaxed));
    }
}
