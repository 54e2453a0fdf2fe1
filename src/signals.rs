// src/signals.rs

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::errors::NyxError;

// Handlers only ever touch these flags and the wake descriptor; all real
// work happens on the poll loop thread.
static NEED_EXIT: AtomicBool = AtomicBool::new(false);
static NEED_RELOAD: AtomicBool = AtomicBool::new(false);
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_terminate(_signum: libc::c_int) {
    NEED_EXIT.store(true, Ordering::Relaxed);
    wake();
}

extern "C" fn on_reload(_signum: libc::c_int) {
    NEED_RELOAD.store(true, Ordering::Relaxed);
    wake();
}

extern "C" fn on_child_exit(_signum: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::Relaxed);
    wake();
}

/// Nudges the poll loop out of its interval wait. Async-signal-safe: one
/// raw write of the eventfd counter increment.
fn wake() {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let one: u64 = 1;
        unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

/// Installs the supervisor's handlers. Called after the forker was forked
/// so the child does not inherit them.
pub fn setup(wake_fd: RawFd) -> Result<(), NyxError> {
    WAKE_FD.store(wake_fd, Ordering::Relaxed);
    NEED_EXIT.store(false, Ordering::Relaxed);
    NEED_RELOAD.store(false, Ordering::Relaxed);
    CHILD_EXITED.store(false, Ordering::Relaxed);

    let terminate = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::SA_RESTART,
        SigSet::all(),
    );
    let reload = SigAction::new(
        SigHandler::Handler(on_reload),
        SaFlags::SA_RESTART,
        SigSet::all(),
    );
    let child = SigAction::new(
        SigHandler::Handler(on_child_exit),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::all(),
    );

    unsafe {
        signal::sigaction(Signal::SIGTERM, &terminate)?;
        signal::sigaction(Signal::SIGINT, &terminate)?;
        signal::sigaction(Signal::SIGQUIT, &terminate)?;
        signal::sigaction(Signal::SIGHUP, &reload)?;
        signal::sigaction(Signal::SIGCHLD, &child)?;
    }

    Ok(())
}

/// Writes on a vanished peer must surface as EPIPE, not kill the process.
pub fn ignore_sigpipe() -> Result<(), NyxError> {
    unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

pub fn need_exit() -> bool {
    NEED_EXIT.load(Ordering::Relaxed)
}

/// Consumes a pending reload request.
pub fn take_reload() -> bool {
    NEED_RELOAD.swap(false, Ordering::Relaxed)
}

/// Consumes a pending child-exit notification.
pub fn take_child_exited() -> bool {
    CHILD_EXITED.swap(false, Ordering::Relaxed)
}
