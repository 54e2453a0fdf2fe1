// src/state.rs

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::Signal;

use crate::log;
use crate::logger::LogLevel;
use crate::watch::Watch;

/// Supervision status of one watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No process is tracked; the initial and post-stop state.
    Unmonitored,
    /// A spawn was requested; waiting for the first successful liveness.
    Starting,
    Running,
    /// A stop was issued; waiting for the process to disappear.
    Stopping,
    /// An unexpected exit was observed; a respawn is pending.
    Restarting,
    /// The restart budget is exhausted; only an operator start revives it.
    Failed,
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatchState::Unmonitored => "unmonitored",
            WatchState::Starting => "starting",
            WatchState::Running => "running",
            WatchState::Stopping => "stopping",
            WatchState::Restarting => "restarting",
            WatchState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Side effects a transition asks the supervisor to perform. The state
/// machine itself never touches the forker pipe, signals or the
/// filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Ask the forker to spawn the watch's start command.
    Spawn,
    /// Ask the forker to run the watch's custom stop command against `pid`.
    StopCommand { pid: i32 },
    /// Send a signal directly from the supervisor.
    Signal { pid: i32, signal: Signal },
    RemovePidFile,
    /// Fire plugin callbacks for a transition that just happened.
    Notify { state: WatchState, pid: i32 },
}

/// Restart budget: how many respawns are tolerated within the sliding
/// window before a watch is marked failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub window: Duration,
    pub limit: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            window: Duration::from_secs(10),
            limit: 5,
        }
    }
}

/// What the poll loop saw for one watch this tick.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub running: bool,
    /// Resource or health violation description, if any.
    pub fault: Option<String>,
}

/// Mutable supervision record, 1:1 with a watch. Holds only a non-owning
/// back-reference (id and name) to the watch it belongs to.
#[derive(Debug)]
pub struct State {
    pub watch_id: i32,
    pub name: String,
    pub pid: i32,
    pub current: WatchState,
    pub last_transition: SystemTime,
    /// Watch was dropped by a reload; discard once quiescent.
    pub removed: bool,

    restarts: VecDeque<Instant>,
    stop_requested: bool,
    restart_pending: bool,
    kill_sent: bool,
    started: Option<Instant>,
    stopping_since: Option<Instant>,
}

impl State {
    pub fn new(watch_id: i32, name: &str) -> Self {
        State {
            watch_id,
            name: name.to_string(),
            pid: 0,
            current: WatchState::Unmonitored,
            last_transition: SystemTime::now(),
            removed: false,
            restarts: VecDeque::new(),
            stop_requested: false,
            restart_pending: false,
            kill_sent: false,
            started: None,
            stopping_since: None,
        }
    }

    /// Adopts an already running process (PID file recovery at boot).
    pub fn adopt(&mut self, pid: i32) -> Vec<Action> {
        let mut actions = Vec::new();
        self.pid = pid;
        self.transition(WatchState::Running, &mut actions);
        actions
    }

    /// Re-binds the state to a watch id of a new configuration generation.
    pub fn set_generation(&mut self, watch_id: i32) {
        self.watch_id = watch_id;
    }

    pub fn is_quiescent(&self) -> bool {
        matches!(self.current, WatchState::Unmonitored | WatchState::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.current,
            WatchState::Starting | WatchState::Running | WatchState::Stopping
        )
    }

    /// Restarts counted against the budget at `now`.
    pub fn restarts_in_window(&self, now: Instant, window: Duration) -> u32 {
        self.restarts
            .iter()
            .filter(|at| now.duration_since(**at) <= window)
            .count() as u32
    }

    /// Operator (or boot) start request. A no-op while the watch is
    /// already starting or running; queued when it is stopping.
    pub fn request_start(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        match self.current {
            WatchState::Running | WatchState::Starting => {
                log!(
                    LogLevel::Debug,
                    "watch '{}' already {}, ignoring start request",
                    self.name,
                    self.current
                );
            }
            WatchState::Stopping => {
                self.restart_pending = true;
            }
            WatchState::Unmonitored | WatchState::Failed | WatchState::Restarting => {
                self.restarts.clear();
                self.begin_start(now, &mut actions);
            }
        }

        actions
    }

    /// Operator stop request. Honored while starting (queued until a PID
    /// is known); repeated stops do not escalate twice.
    pub fn request_stop(&mut self, watch: &Watch, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        match self.current {
            WatchState::Unmonitored | WatchState::Failed | WatchState::Restarting => {}
            WatchState::Stopping => {
                // already on its way down
                self.restart_pending = false;
                self.stop_requested = true;
            }
            WatchState::Starting if self.pid < 1 => {
                self.stop_requested = true;
            }
            WatchState::Starting | WatchState::Running => {
                self.begin_stop(watch, true, now, &mut actions);
            }
        }

        actions
    }

    /// Stop-then-start request, used for watches whose definition changed
    /// on reload. Unlike an operator stop, the respawn stays pending.
    pub fn request_restart(&mut self, watch: &Watch, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        match self.current {
            WatchState::Running => self.begin_stop(watch, false, now, &mut actions),
            WatchState::Starting => {
                if self.pid > 0 {
                    self.begin_stop(watch, false, now, &mut actions);
                } else {
                    self.stop_requested = true;
                    self.restart_pending = true;
                }
            }
            WatchState::Stopping => {
                self.restart_pending = true;
            }
            WatchState::Unmonitored | WatchState::Failed | WatchState::Restarting => {
                self.restarts.clear();
                self.begin_start(now, &mut actions);
            }
        }

        actions
    }

    /// Advances the machine with this tick's observation.
    pub fn handle_poll(
        &mut self,
        watch: &Watch,
        observation: &Observation,
        policy: &RestartPolicy,
        interval: Duration,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        match self.current {
            WatchState::Unmonitored | WatchState::Failed | WatchState::Restarting => {}

            WatchState::Starting => {
                if self.stop_requested && self.pid > 0 {
                    // a queued restart keeps its pending respawn
                    let operator = !self.restart_pending;
                    self.begin_stop(watch, operator, now, &mut actions);
                } else if observation.running {
                    if self.started_for(now) >= Duration::from_secs(watch.startup_delay) {
                        self.transition(WatchState::Running, &mut actions);
                    }
                } else if self.pid > 0 {
                    // the spawn came up and died again
                    self.on_exit(policy, now, &mut actions);
                } else {
                    let grace =
                        Duration::from_secs(watch.startup_delay) + interval * 2;
                    if self.started_for(now) > grace {
                        log!(
                            LogLevel::Error,
                            "watch '{}' did not come up within {}s",
                            self.name,
                            grace.as_secs()
                        );
                        self.transition(WatchState::Failed, &mut actions);
                    }
                }
            }

            WatchState::Running => {
                if !observation.running {
                    log!(
                        LogLevel::Warn,
                        "watch '{}' (pid {}) disappeared",
                        self.name,
                        self.pid
                    );
                    self.on_exit(policy, now, &mut actions);
                } else if let Some(reason) = &observation.fault {
                    log!(
                        LogLevel::Warn,
                        "watch '{}' (pid {}) unhealthy: {} - restarting",
                        self.name,
                        self.pid,
                        reason
                    );
                    self.begin_stop(watch, false, now, &mut actions);
                }
            }

            WatchState::Stopping => {
                if !observation.running {
                    self.finish_stop(policy, now, &mut actions);
                } else if !self.kill_sent
                    && self.stopping_for(now) >= Duration::from_secs(watch.stop_timeout)
                {
                    log!(
                        LogLevel::Warn,
                        "watch '{}' (pid {}) ignored the stop request, killing it",
                        self.name,
                        self.pid
                    );
                    actions.push(Action::Signal {
                        pid: self.pid,
                        signal: Signal::SIGKILL,
                    });
                    self.kill_sent = true;
                    self.finish_stop(policy, now, &mut actions);
                }
            }
        }

        actions
    }

    fn started_for(&self, now: Instant) -> Duration {
        self.started
            .map(|at| now.duration_since(at))
            .unwrap_or_default()
    }

    fn stopping_for(&self, now: Instant) -> Duration {
        self.stopping_since
            .map(|at| now.duration_since(at))
            .unwrap_or_default()
    }

    fn transition(&mut self, to: WatchState, actions: &mut Vec<Action>) {
        log!(
            LogLevel::Info,
            "watch '{}': {} -> {}",
            self.name,
            self.current,
            to
        );
        self.current = to;
        self.last_transition = SystemTime::now();
        actions.push(Action::Notify {
            state: to,
            pid: self.pid,
        });
    }

    fn begin_start(&mut self, now: Instant, actions: &mut Vec<Action>) {
        self.started = Some(now);
        self.stop_requested = false;
        self.kill_sent = false;
        self.transition(WatchState::Starting, actions);
        actions.push(Action::Spawn);
    }

    fn begin_stop(
        &mut self,
        watch: &Watch,
        operator: bool,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        self.stop_requested = operator;
        self.restart_pending = !operator;
        self.kill_sent = false;
        self.stopping_since = Some(now);

        let pid = self.pid;
        self.transition(WatchState::Stopping, actions);

        if watch.stop.is_some() {
            actions.push(Action::StopCommand { pid });
        } else {
            actions.push(Action::Signal {
                pid,
                signal: Signal::SIGTERM,
            });
        }

        if watch.stop_timeout == 0 {
            actions.push(Action::Signal {
                pid,
                signal: Signal::SIGKILL,
            });
            self.kill_sent = true;
        }
    }

    fn finish_stop(&mut self, policy: &RestartPolicy, now: Instant, actions: &mut Vec<Action>) {
        let restart = self.restart_pending;

        self.pid = 0;
        self.stop_requested = false;
        self.restart_pending = false;
        self.stopping_since = None;
        actions.push(Action::RemovePidFile);
        self.transition(WatchState::Unmonitored, actions);

        // a pending respawn (health fault, reload) counts against the
        // same budget as a plain crash
        if restart && !self.removed {
            self.schedule_restart(policy, now, actions);
        }
    }

    /// The tracked process is gone: count a restart against the budget and
    /// either respawn or give up.
    fn on_exit(&mut self, policy: &RestartPolicy, now: Instant, actions: &mut Vec<Action>) {
        self.pid = 0;
        actions.push(Action::RemovePidFile);
        self.transition(WatchState::Restarting, actions);

        if self.removed {
            self.transition(WatchState::Unmonitored, actions);
            return;
        }

        self.schedule_restart(policy, now, actions);
    }

    /// Trims the sliding window, then either begins the next spawn or
    /// gives the watch up when the budget is exhausted.
    fn schedule_restart(&mut self, policy: &RestartPolicy, now: Instant, actions: &mut Vec<Action>) {
        while let Some(front) = self.restarts.front() {
            if now.duration_since(*front) > policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() as u32 >= policy.limit {
            log!(
                LogLevel::Error,
                "watch '{}' exceeded {} restarts within {}s, giving up",
                self.name,
                policy.limit,
                policy.window.as_secs()
            );
            self.transition(WatchState::Failed, actions);
        } else {
            self.restarts.push_back(now);
            self.begin_start(now, actions);
        }
    }
}
