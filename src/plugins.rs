// src/plugins.rs

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::log;
use crate::logger::LogLevel;
use crate::state::WatchState;

/// Observer of watch lifecycle events. Implementations must not block; the
/// callbacks run on the supervisor thread between poll ticks.
pub trait Plugin {
    fn name(&self) -> &str;

    /// Fired on every state transition of any watch.
    fn on_state_change(&self, watch: &str, state: WatchState, pid: i32);

    /// Fired once when the supervisor shuts down.
    fn on_destroy(&self) {}
}

/// Registered plugins, dispatched in registration order. A panicking
/// callback is caught and logged; it never disturbs supervision.
#[derive(Default)]
pub struct PluginRepository {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRepository {
    pub fn new() -> Self {
        PluginRepository {
            plugins: Vec::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        log!(LogLevel::Debug, "registered plugin '{}'", plugin.name());
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn notify_state_change(&self, watch: &str, state: WatchState, pid: i32) {
        for plugin in &self.plugins {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                plugin.on_state_change(watch, state, pid);
            }));

            if outcome.is_err() {
                log!(
                    LogLevel::Error,
                    "plugin '{}' panicked handling state change of '{}'",
                    plugin.name(),
                    watch
                );
            }
        }
    }

    pub fn destroy_all(&self) {
        for plugin in &self.plugins {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                plugin.on_destroy();
            }));

            if outcome.is_err() {
                log!(
                    LogLevel::Error,
                    "plugin '{}' panicked during shutdown",
                    plugin.name()
                );
            }
        }
    }
}
