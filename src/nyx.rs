// src/nyx.rs

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, setsid, ForkResult, Pid};

use crate::cli::NyxOptions;
use crate::config::SupervisorConfig;
use crate::errors::{Errors, NyxError};
use crate::forker::{self, ForkRequest, Forker};
use crate::health;
use crate::log;
use crate::logger::LogLevel;
use crate::pid_file;
use crate::plugins::{Plugin, PluginRepository};
use crate::poll::{self, WakeEvent};
use crate::process;
use crate::signals;
use crate::state::{Action, Observation, RestartPolicy, State, WatchState};
use crate::watch::Watch;

/// The supervisor context: every watch, its runtime state, the forker
/// handle and the wake event live here. Single-threaded; the poll loop and
/// all callbacks run on the thread owning this value.
pub struct Nyx {
    pub options: NyxOptions,
    watches: HashMap<String, Watch>,
    states: Vec<State>,
    plugins: PluginRepository,
    forker: Forker,
    event: WakeEvent,
    runtime_dir: PathBuf,
    polling_interval: u64,
    policy: RestartPolicy,
    is_init: bool,
    failure: Option<NyxError>,
}

impl Nyx {
    /// Loads the configuration and brings the supervisor up. Convenience
    /// wrapper around [`Nyx::with_config`].
    pub fn initialize(options: NyxOptions) -> Result<Self, NyxError> {
        let settings = SupervisorConfig::load(&options.config)?;
        Self::with_config(options, settings)
    }

    /// Brings the supervisor up from already parsed settings: creates the
    /// runtime directory, forks the forker (before any thread or handler
    /// exists), then installs the wake event and signal handlers.
    pub fn with_config(
        options: NyxOptions,
        settings: SupervisorConfig,
    ) -> Result<Self, NyxError> {
        let watch_list = settings.build_watches()?;

        let runtime_dir = runtime_directory(&options);
        fs::create_dir_all(runtime_dir.join("pids"))?;

        let is_init = getpid().as_raw() == 1;
        if is_init {
            log!(LogLevel::Info, "running as PID 1 (init mode)");
        }

        signals::ignore_sigpipe()?;

        let forker = forker::init(
            &watch_list,
            &options.config,
            &runtime_dir,
            options.local_mode,
            options.quiet,
            is_init,
        )?;

        let event = WakeEvent::new()?;
        signals::setup(event.raw_fd())?;

        let states = watch_list
            .iter()
            .map(|watch| State::new(watch.id, &watch.name))
            .collect();
        let watches = watch_list
            .into_iter()
            .map(|watch| (watch.name.clone(), watch))
            .collect();

        let policy = RestartPolicy {
            window: Duration::from_secs(settings.restart_window),
            limit: settings.restart_limit,
        };

        Ok(Nyx {
            options,
            watches,
            states,
            plugins: PluginRepository::new(),
            forker,
            event,
            runtime_dir,
            polling_interval: settings.polling_interval,
            policy,
            is_init,
            failure: None,
        })
    }

    pub fn polling_interval(&self) -> u64 {
        self.polling_interval
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn wake_event(&self) -> &WakeEvent {
        &self.event
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.register(plugin);
    }

    /// Boot pass: adopt still-running processes from PID files, start
    /// everything else.
    pub fn boot(&mut self) {
        let now = Instant::now();

        for idx in 0..self.states.len() {
            let actions = {
                let Nyx {
                    ref mut states,
                    ref watches,
                    ref runtime_dir,
                    ..
                } = *self;

                let state = &mut states[idx];
                let watch = match watches.get(&state.name) {
                    Some(watch) => watch,
                    None => continue,
                };

                watch.dump();

                match pid_file::read_pid(watch, runtime_dir) {
                    Some(pid) if pid > 0 && process::adoptable(pid, watch) => {
                        log!(
                            LogLevel::Info,
                            "watch '{}': adopting running process {}",
                            watch.name,
                            pid
                        );
                        state.adopt(pid)
                    }
                    Some(_) => {
                        pid_file::remove_pid(watch, runtime_dir);
                        state.request_start(now)
                    }
                    None => state.request_start(now),
                }
            };

            self.execute(idx, actions);
        }
    }

    /// Runs the supervisor to completion: boot, poll until told to exit,
    /// orderly shutdown. The error carries the runtime failure, if any.
    pub fn run(&mut self) -> Result<(), NyxError> {
        self.boot();

        let outcome = poll::poll_loop(self, Nyx::dispatch_poll);

        self.shutdown();

        outcome
    }

    /// Operator request: start a watch by name.
    pub fn request_start(&mut self, name: &str) -> bool {
        let now = Instant::now();
        let idx = match self.states.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                log!(LogLevel::Warn, "no watch named '{}'", name);
                return false;
            }
        };

        let actions = self.states[idx].request_start(now);
        self.execute(idx, actions);
        true
    }

    /// Operator request: stop a watch by name.
    pub fn request_stop(&mut self, name: &str) -> bool {
        let now = Instant::now();

        let actions = {
            let Nyx {
                ref mut states,
                ref watches,
                ..
            } = *self;

            let idx = match states.iter().position(|s| s.name == name) {
                Some(idx) => idx,
                None => {
                    log!(LogLevel::Warn, "no watch named '{}'", name);
                    return false;
                }
            };

            let state = &mut states[idx];
            match watches.get(&state.name) {
                Some(watch) => (idx, state.request_stop(watch, now)),
                None => return false,
            }
        };

        self.execute(actions.0, actions.1);
        true
    }

    /// Operator request: re-read the configuration.
    pub fn request_reload(&mut self) {
        self.reload();
    }

    /// Re-reads the configuration and reconciles the watch set: removed
    /// watches are stopped and dropped once quiescent, added watches are
    /// started, changed watches are stopped and respawned under their new
    /// definition. A parse failure keeps the current configuration.
    pub fn reload(&mut self) {
        log!(LogLevel::Info, "reloading configuration");

        let settings = match SupervisorConfig::load(&self.options.config) {
            Ok(settings) => settings,
            Err(err) => {
                log!(
                    LogLevel::Warn,
                    "reload failed, keeping current configuration: {}",
                    err
                );
                return;
            }
        };

        let new_watches = match settings.build_watches() {
            Ok(watches) => watches,
            Err(err) => {
                log!(
                    LogLevel::Warn,
                    "reload failed, keeping current configuration: {}",
                    err
                );
                return;
            }
        };

        let now = Instant::now();

        // Stop removed watches while the forker still knows their ids;
        // the reload message follows the stop requests on the pipe.
        for idx in 0..self.states.len() {
            let name = self.states[idx].name.clone();
            if new_watches.iter().any(|w| w.name == name) {
                continue;
            }

            log!(LogLevel::Info, "watch '{}' removed by reload", name);

            let actions = {
                let Nyx {
                    ref mut states,
                    ref watches,
                    ..
                } = *self;

                let state = &mut states[idx];
                state.removed = true;
                match watches.get(&state.name) {
                    Some(watch) => state.request_stop(watch, now),
                    None => Vec::new(),
                }
            };

            self.execute(idx, actions);
        }

        if let Err(err) = self.forker.send(&ForkRequest::Reload) {
            log!(LogLevel::Error, "{}", err);
            self.failure = Some(err);
            return;
        }

        self.polling_interval = settings.polling_interval;
        self.policy = RestartPolicy {
            window: Duration::from_secs(settings.restart_window),
            limit: settings.restart_limit,
        };

        let mut added: Vec<String> = Vec::new();
        let mut changed: Vec<String> = Vec::new();

        for watch in &new_watches {
            match self.watches.get(&watch.name) {
                None => added.push(watch.name.clone()),
                Some(old) if !old.same_spec(watch) => changed.push(watch.name.clone()),
                Some(_) => {}
            }
        }

        // swap in the new generation
        for watch in new_watches {
            let name = watch.name.clone();
            let id = watch.id;

            self.watches.insert(name.clone(), watch);

            match self.states.iter_mut().find(|s| s.name == name) {
                Some(state) => state.set_generation(id),
                None => self.states.push(State::new(id, &name)),
            }
        }

        for name in added {
            log!(LogLevel::Info, "watch '{}' added by reload", name);
            self.request_start(&name);
        }

        for name in changed {
            log!(LogLevel::Info, "watch '{}' changed by reload, restarting", name);

            let actions = {
                let Nyx {
                    ref mut states,
                    ref watches,
                    ..
                } = *self;

                let idx = match states.iter().position(|s| s.name == name) {
                    Some(idx) => idx,
                    None => continue,
                };

                let state = &mut states[idx];
                match watches.get(&state.name) {
                    Some(watch) => (idx, state.request_restart(watch, now)),
                    None => continue,
                }
            };

            self.execute(actions.0, actions.1);
        }
    }

    /// One watch's observation for this tick: resolve an unknown PID from
    /// the PID file, check liveness, evaluate limits and health checks.
    pub fn observe(&mut self, idx: usize) -> Observation {
        let Nyx {
            ref mut states,
            ref watches,
            ref runtime_dir,
            ..
        } = *self;

        let state = &mut states[idx];
        let watch = match watches.get(&state.name) {
            Some(watch) => watch,
            None => return Observation::default(),
        };

        if state.pid < 1 {
            if let Some(pid) = pid_file::read_pid(watch, runtime_dir) {
                if pid > 0 {
                    state.pid = pid;
                }
            }
        }

        if state.pid < 1 {
            log!(LogLevel::Debug, "Poll: watch '{}' has no PID (yet)", state.name);
            return Observation::default();
        }

        let running = process::check_process_running(state.pid);

        log!(
            LogLevel::Debug,
            "Poll: watch '{}' process with PID {} is {}running",
            state.name,
            state.pid,
            if running { "" } else { "not " }
        );

        let fault = if running && state.current == WatchState::Running {
            watch_fault(watch, state.pid)
        } else {
            None
        };

        Observation { running, fault }
    }

    /// The standard poll handler: advance the state machine and carry out
    /// whatever it asked for.
    pub fn dispatch_poll(nyx: &mut Nyx, idx: usize, observation: &Observation) {
        let now = Instant::now();

        let actions = {
            let Nyx {
                ref mut states,
                ref watches,
                policy,
                polling_interval,
                ..
            } = *nyx;

            let state = &mut states[idx];
            let watch = match watches.get(&state.name) {
                Some(watch) => watch,
                None => return,
            };

            state.handle_poll(
                watch,
                observation,
                &policy,
                Duration::from_secs(polling_interval.max(1)),
                now,
            )
        };

        nyx.execute(idx, actions);
    }

    /// Surfaces a runtime failure recorded while executing actions.
    pub fn take_failure(&mut self) -> Result<(), NyxError> {
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drops watches removed by a reload once their state went quiet.
    pub fn prune_removed(&mut self) {
        let mut idx = 0;

        while idx < self.states.len() {
            if self.states[idx].removed && self.states[idx].is_quiescent() {
                let name = self.states[idx].name.clone();
                log!(LogLevel::Debug, "dropping watch '{}'", name);
                self.watches.remove(&name);
                self.states.remove(idx);
            } else {
                idx += 1;
            }
        }
    }

    /// Reaps exited children. In init mode this collects re-parented
    /// orphans as well; the forker exiting is fatal to supervision.
    pub fn reap_children(&mut self) -> Result<(), NyxError> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        log!(LogLevel::Debug, "reaped child {}", pid);
                        if pid == self.forker.pid() {
                            log!(LogLevel::Error, "forker died");
                            return Err(NyxError::new(Errors::Forker, "forker died"));
                        }
                    }
                }
                Err(nix::errno::Errno::ECHILD) => break,
                Err(err) => {
                    log!(LogLevel::Warn, "waitpid failed: {}", err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Orderly teardown: stop every active watch, wait out the stop
    /// timeouts, close the forker pipe and collect the forker.
    pub fn shutdown(&mut self) {
        log!(LogLevel::Info, "shutting down");

        let now = Instant::now();

        for idx in 0..self.states.len() {
            let actions = {
                let Nyx {
                    ref mut states,
                    ref watches,
                    ..
                } = *self;

                let state = &mut states[idx];
                if !state.is_active() {
                    continue;
                }

                match watches.get(&state.name) {
                    Some(watch) => state.request_stop(watch, now),
                    None => Vec::new(),
                }
            };

            self.execute(idx, actions);
        }

        let longest = self
            .watches
            .values()
            .map(|watch| watch.stop_timeout)
            .max()
            .unwrap_or(0);
        let deadline = Instant::now() + Duration::from_secs(longest + 2);

        while self.states.iter().any(|s| s.is_active()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(250));

            for idx in 0..self.state_count() {
                let observation = self.observe(idx);
                Nyx::dispatch_poll(self, idx, &observation);
            }
        }

        self.forker.close();

        match waitpid(self.forker.pid(), None) {
            Ok(_) => log!(LogLevel::Debug, "forker terminated"),
            Err(_) => {}
        }

        self.plugins.destroy_all();

        log!(LogLevel::Info, "shutdown complete");
    }

    fn execute(&mut self, idx: usize, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }

        let name = self.states[idx].name.clone();
        let watch_id = self.states[idx].watch_id;

        for action in actions {
            match action {
                Action::Spawn => {
                    if let Err(err) = self.forker.send(&ForkRequest::Spawn { id: watch_id }) {
                        log!(LogLevel::Error, "watch '{}': {}", name, err);
                        self.failure = Some(err);
                    }
                }
                Action::StopCommand { pid } => {
                    if let Err(err) =
                        self.forker.send(&ForkRequest::Stop { id: watch_id, pid })
                    {
                        log!(LogLevel::Error, "watch '{}': {}", name, err);
                        self.failure = Some(err);
                    }
                }
                Action::Signal { pid, signal } => {
                    if pid > 0 {
                        match kill(Pid::from_raw(pid), signal) {
                            Ok(()) => {}
                            Err(nix::errno::Errno::ESRCH) => {}
                            Err(err) => {
                                log!(
                                    LogLevel::Warn,
                                    "watch '{}': failed to signal pid {}: {}",
                                    name,
                                    pid,
                                    err
                                );
                            }
                        }
                    }
                }
                Action::RemovePidFile => {
                    if let Some(watch) = self.watches.get(&name) {
                        pid_file::remove_pid(watch, &self.runtime_dir);
                    }
                }
                Action::Notify { state, pid } => {
                    self.plugins.notify_state_change(&name, state, pid);
                }
            }
        }
    }
}

/// Resource and health verdict for a running watch.
fn watch_fault(watch: &Watch, pid: i32) -> Option<String> {
    if watch.max_cpu.is_some() || watch.max_memory.is_some() {
        if let Ok(usage) = process::resource_usage(pid) {
            if let Some(max_cpu) = watch.max_cpu {
                if usage.cpu_percent > max_cpu as f32 {
                    return Some(format!(
                        "cpu usage {:.1}% exceeds limit of {}%",
                        usage.cpu_percent, max_cpu
                    ));
                }
            }

            if let Some(max_memory) = watch.max_memory {
                if usage.memory_bytes > max_memory {
                    return Some(format!(
                        "memory usage of {} bytes exceeds limit of {}",
                        usage.memory_bytes, max_memory
                    ));
                }
            }
        }
    }

    if let Some(port) = watch.port_check {
        if !health::port_open(port) {
            return Some(format!("port {} not accepting connections", port));
        }
    }

    if let (Some(path), Some(port)) = (&watch.http_check, watch.http_check_port) {
        if !health::http_ok(port, path) {
            return Some(format!("http check on port {} failed", port));
        }
    }

    None
}

/// Where PID files and the control socket live: `NYX_DIR` wins, `--local`
/// keeps state next to the current directory, system mode uses /var/run.
fn runtime_directory(options: &NyxOptions) -> PathBuf {
    if let Ok(dir) = std::env::var("NYX_DIR") {
        return PathBuf::from(dir);
    }

    if options.local_mode {
        return std::env::current_dir()
            .map(|dir| dir.join(".nyx"))
            .unwrap_or_else(|_| PathBuf::from(".nyx"));
    }

    PathBuf::from("/var/run/nyx")
}

/// Detaches the supervisor from the terminal: double-fork with a new
/// session in between, stdio pointed at /dev/null. Flushes first so
/// buffered output is not duplicated into the children.
pub fn daemonize() -> Result<(), NyxError> {
    io::stdout().flush()?;
    io::stderr().flush()?;

    match unsafe { fork() } {
        Err(errno) => {
            return Err(NyxError::new(
                Errors::Process,
                format!("fork failed: {}", errno),
            ))
        }
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
    }

    setsid().map_err(|errno| {
        NyxError::new(Errors::Process, format!("setsid failed: {}", errno))
    })?;

    match unsafe { fork() } {
        Err(errno) => {
            return Err(NyxError::new(
                Errors::Process,
                format!("fork failed: {}", errno),
            ))
        }
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
    }

    unsafe {
        let null = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            libc::dup2(null, 2);
            if null > 2 {
                libc::close(null);
            }
        }
    }

    Ok(())
}
