// src/forker.rs

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult, Pid};
use users::os::unix::UserExt;
use users::{Groups, Users, UsersCache};

use crate::config::SupervisorConfig;
use crate::errors::{Errors, NyxError};
use crate::log;
use crate::logger::LogLevel;
use crate::pid_file;
use crate::watch::Watch;

/// Reserved watch id carrying the reload command on the wire.
pub const RELOAD_ID: i32 = -1;

/// Size of one encoded request. Well below PIPE_BUF, so writes are atomic.
pub const REQUEST_SIZE: usize = 9;

const DEV_NULL: &[u8] = b"/dev/null\0";
const PROC_SELF_FD: &[u8] = b"/proc/self/fd\0";

/// The only message type travelling from the supervisor to the forker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRequest {
    /// Launch the watch's start command.
    Spawn { id: i32 },
    /// Run the watch's custom stop command against `pid`.
    Stop { id: i32, pid: i32 },
    /// Re-read the configuration file and replace the watch set.
    Reload,
}

impl ForkRequest {
    /// Packed wire format: 32-bit id, 8-bit start flag, 32-bit pid, native
    /// byte order.
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let (id, start, pid) = match self {
            ForkRequest::Spawn { id } => (*id, 1u8, 0i32),
            ForkRequest::Stop { id, pid } => (*id, 0u8, *pid),
            ForkRequest::Reload => (RELOAD_ID, 1u8, 0i32),
        };

        let mut buf = [0u8; REQUEST_SIZE];
        buf[0..4].copy_from_slice(&id.to_ne_bytes());
        buf[4] = start;
        buf[5..9].copy_from_slice(&pid.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REQUEST_SIZE]) -> ForkRequest {
        let id = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let start = buf[4] != 0;
        let pid = i32::from_ne_bytes([buf[5], buf[6], buf[7], buf[8]]);

        if id < 0 {
            ForkRequest::Reload
        } else if start {
            ForkRequest::Spawn { id }
        } else {
            ForkRequest::Stop { id, pid }
        }
    }
}

/// Supervisor-side handle to the forker child: its PID and the write end
/// of the request pipe. Dropping (or closing) the pipe terminates the
/// forker.
pub struct Forker {
    pid: Pid,
    pipe: Option<OwnedFd>,
}

impl Forker {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn send(&self, request: &ForkRequest) -> Result<(), NyxError> {
        let pipe = match &self.pipe {
            Some(pipe) => pipe,
            None => {
                return Err(NyxError::new(Errors::Forker, "forker pipe already closed"))
            }
        };

        let buf = request.encode();
        let written = unsafe {
            libc::write(
                pipe.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                REQUEST_SIZE,
            )
        };

        if written == REQUEST_SIZE as isize {
            return Ok(());
        }

        if written < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPIPE) {
                return Err(NyxError::new(Errors::Forker, "forker died (broken pipe)"));
            }
            return Err(NyxError::new(
                Errors::Forker,
                format!("failed to write to forker pipe: {}", err),
            ));
        }

        Err(NyxError::new(Errors::Forker, "short write on forker pipe"))
    }

    /// Closes the request pipe; the forker terminates on the EOF.
    pub fn close(&mut self) {
        self.pipe = None;
    }
}

/// Forks the forker child. Must be called before the supervisor creates
/// threads or installs its own signal handlers, so the child starts from a
/// clean slate.
pub fn init(
    watches: &[Watch],
    config_path: &Path,
    runtime_dir: &Path,
    local_mode: bool,
    quiet: bool,
    is_init: bool,
) -> Result<Forker, NyxError> {
    let (read_end, write_end) = pipe()
        .map_err(|err| NyxError::new(Errors::Forker, format!("pipe failed: {}", err)))?;

    let context = ForkerContext {
        watches: watches.iter().map(|w| (w.id, w.clone())).collect(),
        config_path: config_path.to_path_buf(),
        runtime_dir: runtime_dir.to_path_buf(),
        local_mode,
        is_init,
        proxy_output: is_init && !quiet,
    };

    match unsafe { fork() } {
        Err(errno) => Err(NyxError::new(
            Errors::Forker,
            format!("fork failed: {}", errno),
        )),
        Ok(ForkResult::Child) => {
            drop(write_end);

            // terminated by the supervisor closing the pipe, not by ^C
            let _ = unsafe { signal::signal(Signal::SIGINT, SigHandler::SigIgn) };

            context.run(read_end);
            std::process::exit(0);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(read_end);
            log!(LogLevel::Debug, "forker started with pid {}", child);
            Ok(Forker {
                pid: child,
                pipe: Some(write_end),
            })
        }
    }
}

enum ReadOutcome {
    Full,
    Eof,
    Failed(std::io::Error),
}

fn read_request(fd: RawFd, buf: &mut [u8; REQUEST_SIZE]) -> ReadOutcome {
    let mut total = 0;

    while total < REQUEST_SIZE {
        let read = unsafe {
            libc::read(
                fd,
                buf.as_mut_ptr().add(total) as *mut libc::c_void,
                REQUEST_SIZE - total,
            )
        };

        if read == 0 {
            // a partial record can only mean the supervisor went away
            return ReadOutcome::Eof;
        }

        if read < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return ReadOutcome::Failed(err);
        }

        total += read as usize;
    }

    ReadOutcome::Full
}

enum SpawnTask {
    Start,
    Stop { pid: i32 },
}

enum StdioTarget {
    Null,
    Append(CString),
    Inherit,
}

/// Everything the exec'd child needs, assembled before fork() so the
/// post-fork path stays on async-signal-safe calls.
struct Spawn {
    program: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
    dir: CString,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    user: Option<CString>,
    stdout: StdioTarget,
    stderr: StdioTarget,
}

/// The forker's private half of the world: its own copy of the watch set,
/// synchronized with the supervisor only through reload messages.
struct ForkerContext {
    watches: HashMap<i32, Watch>,
    config_path: PathBuf,
    runtime_dir: PathBuf,
    local_mode: bool,
    is_init: bool,
    proxy_output: bool,
}

impl ForkerContext {
    fn run(mut self, pipe: OwnedFd) {
        if self.is_init {
            log!(
                LogLevel::Debug,
                "running in init-mode - listening for child termination"
            );

            let action = SigAction::new(
                SigHandler::Handler(handle_child_exit),
                SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART,
                SigSet::all(),
            );

            if let Err(err) = unsafe { signal::sigaction(Signal::SIGCHLD, &action) } {
                log!(LogLevel::Warn, "forker: failed to install SIGCHLD handler: {}", err);
            }
        }

        let fd = pipe.as_raw_fd();
        let mut buf = [0u8; REQUEST_SIZE];

        loop {
            if !self.is_init {
                self.reap_finished();
            }

            match read_request(fd, &mut buf) {
                ReadOutcome::Eof => break,
                ReadOutcome::Failed(err) => {
                    log!(LogLevel::Error, "forker: pipe read failed: {}", err);
                    break;
                }
                ReadOutcome::Full => {}
            }

            match ForkRequest::decode(&buf) {
                ForkRequest::Reload => {
                    log!(LogLevel::Debug, "forker: received reload command");
                    self.reload();
                }
                ForkRequest::Spawn { id } => {
                    log!(LogLevel::Debug, "forker: received start for watch id {}", id);

                    let watch = match self.watches.get(&id) {
                        Some(watch) => watch,
                        None => {
                            log!(LogLevel::Warn, "forker: no watch with id {} found!", id);
                            continue;
                        }
                    };

                    let pid = match self.spawn_start(watch) {
                        Ok(pid) => pid,
                        Err(err) => {
                            log!(
                                LogLevel::Error,
                                "forker: failed to spawn watch '{}': {}",
                                watch.name,
                                err
                            );
                            0
                        }
                    };

                    if let Err(err) = pid_file::write_pid(pid, watch, &self.runtime_dir) {
                        log!(
                            LogLevel::Warn,
                            "watch '{}': failed to write pid file: {}",
                            watch.name,
                            err
                        );
                    }
                }
                ForkRequest::Stop { id, pid } => {
                    log!(LogLevel::Debug, "forker: received stop for watch id {}", id);

                    let watch = match self.watches.get(&id) {
                        Some(watch) => watch,
                        None => {
                            log!(LogLevel::Warn, "forker: no watch with id {} found!", id);
                            continue;
                        }
                    };

                    if let Err(err) = self.spawn_stop(watch, pid) {
                        log!(
                            LogLevel::Error,
                            "forker: failed to run stop command of '{}': {}",
                            watch.name,
                            err
                        );
                    }
                }
            }
        }

        drop(pipe);
        log!(LogLevel::Debug, "forker: terminated");
    }

    fn reload(&mut self) {
        let parsed = SupervisorConfig::load(&self.config_path)
            .and_then(|config| config.build_watches());

        match parsed {
            Ok(watches) => {
                self.watches = watches.into_iter().map(|w| (w.id, w)).collect();
                log!(LogLevel::Debug, "forker: successfully reloaded config");
            }
            Err(err) => {
                log!(LogLevel::Warn, "forker: failed to reload config: {}", err);
            }
        }
    }

    /// Collects exited stop helpers so they don't linger as zombies. The
    /// double-fork intermediates are reaped synchronously in spawn_start.
    fn reap_finished(&self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn spawn_start(&self, watch: &Watch) -> Result<i32, NyxError> {
        let spawn = self.build_spawn(watch, SpawnTask::Start)?;

        // In init mode the forker reaps orphans itself, so a single fork
        // is enough; otherwise the grandchild is detached via double-fork
        // and its PID handed back through a pipe.
        if self.is_init {
            return match unsafe { fork() } {
                Err(errno) => Err(NyxError::new(
                    Errors::Forker,
                    format!("fork failed: {}", errno),
                )),
                Ok(ForkResult::Child) => exec_child(&spawn),
                Ok(ForkResult::Parent { child }) => Ok(child.as_raw()),
            };
        }

        let (read_end, write_end) = pipe()
            .map_err(|err| NyxError::new(Errors::Forker, format!("pipe failed: {}", err)))?;

        match unsafe { fork() } {
            Err(errno) => Err(NyxError::new(
                Errors::Forker,
                format!("fork failed: {}", errno),
            )),
            Ok(ForkResult::Child) => {
                match unsafe { fork() } {
                    Ok(ForkResult::Child) => exec_child(&spawn),
                    Ok(ForkResult::Parent { child }) => {
                        drop(read_end);

                        let line = format!("{}\n", child.as_raw());
                        let bytes = line.as_bytes();
                        unsafe {
                            libc::write(
                                write_end.as_raw_fd(),
                                bytes.as_ptr() as *const libc::c_void,
                                bytes.len(),
                            );
                            libc::_exit(0);
                        }
                    }
                    Err(_) => unsafe { libc::_exit(1) },
                }
            }
            Ok(ForkResult::Parent { child: intermediate }) => {
                drop(write_end);

                let pid = read_decimal(read_end.as_raw_fd());
                let _ = waitpid(intermediate, None);

                Ok(pid)
            }
        }
    }

    fn spawn_stop(&self, watch: &Watch, stop_pid: i32) -> Result<(), NyxError> {
        let spawn = self.build_spawn(watch, SpawnTask::Stop { pid: stop_pid })?;

        // The helper's own PID is of no interest; it is not the process
        // being supervised.
        match unsafe { fork() } {
            Err(errno) => Err(NyxError::new(
                Errors::Forker,
                format!("fork failed: {}", errno),
            )),
            Ok(ForkResult::Child) => exec_child(&spawn),
            Ok(ForkResult::Parent { .. }) => Ok(()),
        }
    }

    fn build_spawn(&self, watch: &Watch, task: SpawnTask) -> Result<Spawn, NyxError> {
        let start = matches!(task, SpawnTask::Start);

        let args = if start {
            &watch.start
        } else {
            watch.stop.as_ref().ok_or_else(|| {
                NyxError::new(
                    Errors::Forker,
                    format!("watch '{}' has no stop command", watch.name),
                )
            })?
        };

        let program = cstring(&args[0])?;
        let argv = args
            .iter()
            .map(|arg| cstring(arg))
            .collect::<Result<Vec<_>, _>>()?;

        // resolve credentials before fork
        let mut uid = None;
        let mut gid = None;
        let mut user = None;
        let mut home = None;

        let cache = UsersCache::new();

        if let Some(name) = &watch.uid {
            let account = cache.get_user_by_name(name).ok_or_else(|| {
                NyxError::new(
                    Errors::User,
                    format!("watch '{}': unknown user '{}'", watch.name, name),
                )
            })?;
            uid = Some(account.uid());
            gid = Some(account.primary_group_id());
            user = Some(cstring(name)?);
            home = Some(account.home_dir().display().to_string());
        }

        if let Some(name) = &watch.gid {
            let group = cache.get_group_by_name(name).ok_or_else(|| {
                NyxError::new(
                    Errors::User,
                    format!("watch '{}': unknown group '{}'", watch.name, name),
                )
            })?;
            gid = Some(group.gid());
        }

        // inherited environment, watch overrides on top
        let mut env_map: HashMap<String, String> = std::env::vars().collect();
        for (key, value) in &watch.env {
            env_map.insert(key.clone(), value.clone());
        }

        // USER and HOME must name the target account, not whatever the
        // supervisor was launched under; only an explicit watch entry wins
        if let Some(name) = &watch.uid {
            if !watch.env.contains_key("USER") {
                env_map.insert(String::from("USER"), name.clone());
            }
            if let Some(home) = &home {
                if !watch.env.contains_key("HOME") {
                    env_map.insert(String::from("HOME"), home.clone());
                }
            }
        }

        if let SpawnTask::Stop { pid } = task {
            env_map.insert(String::from("NYX_PID"), pid.to_string());
        }

        let env = env_map
            .iter()
            .map(|(key, value)| cstring(&format!("{}={}", key, value)))
            .collect::<Result<Vec<_>, _>>()?;

        let dir = match &watch.dir {
            Some(dir) if !dir.is_empty() => cstring(dir)?,
            _ => {
                if self.local_mode {
                    cstring(&self.runtime_dir.display().to_string())?
                } else {
                    cstring("/")?
                }
            }
        };

        let stdout = match &watch.log_file {
            Some(path) if start => StdioTarget::Append(cstring(path)?),
            _ if start && self.proxy_output => StdioTarget::Inherit,
            _ => StdioTarget::Null,
        };

        let stderr = match &watch.error_file {
            Some(path) if start => StdioTarget::Append(cstring(path)?),
            _ if start && self.proxy_output => StdioTarget::Inherit,
            _ => StdioTarget::Null,
        };

        Ok(Spawn {
            program,
            argv,
            env,
            dir,
            uid,
            gid,
            user,
            stdout,
            stderr,
        })
    }
}

fn cstring(value: &str) -> Result<CString, NyxError> {
    CString::new(value)
        .map_err(|_| NyxError::new(Errors::Config, "embedded NUL in configuration string"))
}

fn read_decimal(fd: RawFd) -> i32 {
    let mut buf = [0u8; 32];
    let mut total = 0;

    while total < buf.len() {
        let read = unsafe {
            libc::read(
                fd,
                buf.as_mut_ptr().add(total) as *mut libc::c_void,
                buf.len() - total,
            )
        };

        if read > 0 {
            total += read as usize;
            continue;
        }

        if read < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
        }

        break;
    }

    String::from_utf8_lossy(&buf[..total])
        .trim()
        .parse::<i32>()
        .unwrap_or(0)
}

/// Prepares the process image and execs. Runs in the forked child; only
/// async-signal-safe calls until execvpe, with `_exit` on any failure.
fn exec_child(spawn: &Spawn) -> ! {
    let mut argv: Vec<*const libc::c_char> = spawn.argv.iter().map(|arg| arg.as_ptr()).collect();
    argv.push(std::ptr::null());

    let mut envp: Vec<*const libc::c_char> = spawn.env.iter().map(|var| var.as_ptr()).collect();
    envp.push(std::ptr::null());

    unsafe {
        libc::setsid();
        libc::umask(0);

        if let Some(gid) = spawn.gid {
            let groups = [gid];
            libc::setgroups(1, groups.as_ptr());
            libc::setgid(gid);
        }

        if let (Some(user), Some(gid)) = (&spawn.user, spawn.gid) {
            libc::initgroups(user.as_ptr(), gid);
        }

        if let Some(uid) = spawn.uid {
            libc::setuid(uid);
        }

        if libc::chdir(spawn.dir.as_ptr()) == -1 {
            libc::_exit(1);
        }

        // stdin from /dev/null
        libc::close(0);
        if libc::open(DEV_NULL.as_ptr() as *const libc::c_char, libc::O_RDONLY) == -1 {
            libc::_exit(1);
        }

        redirect(1, &spawn.stdout, libc::O_WRONLY);
        redirect(2, &spawn.stderr, libc::O_RDWR);

        close_inherited_fds();

        libc::execvpe(spawn.program.as_ptr(), argv.as_ptr(), envp.as_ptr());

        // a missing binary must not bring the watch down for good
        if *libc::__errno_location() == libc::ENOENT {
            libc::_exit(0);
        }

        libc::_exit(1);
    }
}

unsafe fn redirect(fd: RawFd, target: &StdioTarget, null_flags: libc::c_int) {
    match target {
        StdioTarget::Inherit => {}
        StdioTarget::Null => {
            libc::close(fd);
            if libc::open(DEV_NULL.as_ptr() as *const libc::c_char, null_flags) == -1 {
                libc::_exit(1);
            }
        }
        StdioTarget::Append(path) => {
            libc::close(fd);
            if libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_APPEND | libc::O_CREAT,
                0o644,
            ) == -1
            {
                libc::_exit(1);
            }
        }
    }
}

/// Closes every inherited descriptor >= 3: /proc/self/fd first (correct on
/// large descriptor tables), numeric sweep as the fallback.
unsafe fn close_inherited_fds() {
    let dir = libc::opendir(PROC_SELF_FD.as_ptr() as *const libc::c_char);
    if !dir.is_null() {
        let dir_fd = libc::dirfd(dir);

        loop {
            let entry = libc::readdir(dir);
            if entry.is_null() {
                break;
            }

            let name = CStr::from_ptr((*entry).d_name.as_ptr());
            if let Ok(fd) = name.to_string_lossy().parse::<i32>() {
                if fd >= 3 && fd != dir_fd {
                    libc::close(fd);
                }
            }
        }

        libc::closedir(dir);
        return;
    }

    let mut max = libc::getdtablesize();
    if max == -1 {
        max = 256;
    }

    for fd in 3..max {
        libc::close(fd);
    }
}

/// SIGCHLD handler installed in init mode: reap everything that exited,
/// preserving errno.
extern "C" fn handle_child_exit(_signum: libc::c_int) {
    unsafe {
        let saved_errno = *libc::__errno_location();

        while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}

        *libc::__errno_location() = saved_errno;
    }
}
