// src/poll.rs

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::errors::{Errors, NyxError};
use crate::log;
use crate::logger::LogLevel;
use crate::nyx::Nyx;
use crate::signals;
use crate::state::Observation;

/// Advances one watch with this tick's observation; the default is
/// [`Nyx::dispatch_poll`].
pub type PollHandler = fn(&mut Nyx, usize, &Observation);

/// Event descriptor the interval wait blocks on. Signal handlers write to
/// it so a shutdown or reload request interrupts the sleep immediately.
pub struct WakeEvent {
    event: EventFd,
}

impl WakeEvent {
    pub fn new() -> Result<Self, NyxError> {
        let event = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .map_err(|err| NyxError::new(Errors::InputOutput, format!("eventfd failed: {}", err)))?;
        Ok(WakeEvent { event })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.event.as_fd().as_raw_fd()
    }

    /// Blocks up to `timeout`, returning early when the event fd was
    /// written to or a signal arrived.
    pub fn wait_interval(&self, timeout: Duration) {
        let mut pollfd = libc::pollfd {
            fd: self.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        let ready = unsafe { libc::poll(&mut pollfd, 1 as libc::nfds_t, timeout_ms) };

        if ready > 0 && pollfd.revents & libc::POLLIN != 0 {
            // drain the counter so the next wait blocks again
            let mut counter = [0u8; 8];
            unsafe {
                libc::read(
                    self.raw_fd(),
                    counter.as_mut_ptr() as *mut libc::c_void,
                    counter.len(),
                );
            }
        }
    }
}

/// The supervisor's main loop: inspect every watch, hand the observation
/// to the handler, sleep until the next tick or the next wakeup. Returns
/// once `need_exit` is observed; a runtime failure (notably the forker
/// dying) surfaces as an error.
pub fn poll_loop(nyx: &mut Nyx, handler: PollHandler) -> Result<(), NyxError> {
    let interval = nyx.polling_interval().max(1);

    log!(
        LogLevel::Debug,
        "Starting polling manager loop (interval: {} sec)",
        interval
    );

    while !signals::need_exit() {
        if signals::take_child_exited() {
            nyx.reap_children()?;
        }

        if signals::take_reload() {
            nyx.reload();
        }

        for idx in 0..nyx.state_count() {
            let observation = nyx.observe(idx);
            handler(nyx, idx, &observation);
        }

        nyx.take_failure()?;
        nyx.prune_removed();

        nyx.wake_event().wait_interval(Duration::from_secs(interval));
    }

    log!(LogLevel::Debug, "Leaving polling manager loop");

    Ok(())
}
