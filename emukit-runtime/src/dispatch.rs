//! The event handler: the loop a PD host process runs once its payload is
//! bound and initialized.
//!
//! Waits on two descriptors -- the notification doorbell and the PPC
//! request pipe -- and dispatches into the payload's `notified`/`protected`
//! entry points exactly as the original kernel's scheduler would dispatch
//! into a task woken by a pending IPC.

use std::cell::Cell;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::EventFd;
use nix::unistd::{read, write};

use crate::binder::Payload;

/// Request record written by a caller's `ppcall`: channel, `msginfo`, and the
/// raw fd the reply should be written to.
const REQUEST_LEN: usize = 24;

pub struct Dispatcher {
    notify: EventFd,
    mask: *const AtomicU64,
    send_rx: RawFd,
    /// Toggled every iteration so the two sources take turns being checked
    /// (and thus serviced) first. Both sources are still drained whenever
    /// they're ready in the same iteration; this only changes which one
    /// goes first, so that a sustained flood on one source can never push
    /// the other's servicing to the back of every iteration.
    notify_checked_first: Cell<bool>,
}

impl Dispatcher {
    /// # Safety
    ///
    /// `notify` must be this process's own doorbell, `mask` a pointer into an
    /// 8-byte `memfd` mapped `MAP_SHARED` for this process's lifetime, and
    /// `send_rx` the read end of this process's own send pipe.
    pub unsafe fn new(notify: EventFd, mask: *const AtomicU64, send_rx: RawFd) -> Self {
        Self {
            notify,
            mask,
            send_rx,
            notify_checked_first: Cell::new(true),
        }
    }

    /// Runs until the notify or send descriptors are closed (the loader
    /// tore the system down) or a read fails unexpectedly.
    pub fn run(&self, payload: &Payload) {
        loop {
            let notify_fd = self.notify.as_fd();
            // Safety: `send_rx` is owned by the manifest for this process's
            // lifetime.
            let send_rx_fd = unsafe { BorrowedFd::borrow_raw(self.send_rx) };
            let mut fds = [
                PollFd::new(notify_fd, PollFlags::POLLIN),
                PollFd::new(send_rx_fd, PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::error!("poll failed: {e}");
                    return;
                }
            }
            let notify_ready = fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            let send_ready = fds[1]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            let hup = fds
                .iter()
                .any(|fd| fd.revents().is_some_and(|r| r.contains(PollFlags::POLLHUP)));

            let notify_first = self.notify_checked_first.replace(!self.notify_checked_first.get());
            let service_notify = |keep_going: &mut bool| {
                if self.notify.read().is_err() {
                    log::warn!("notification doorbell closed");
                    if hup {
                        *keep_going = false;
                    }
                } else {
                    self.drain_notifications(payload);
                }
            };
            let service_send = |keep_going: &mut bool| {
                if !self.service_one_request(payload) {
                    *keep_going = false;
                }
            };

            let mut keep_going = true;
            if notify_first {
                if notify_ready {
                    service_notify(&mut keep_going);
                }
                if send_ready {
                    service_send(&mut keep_going);
                }
            } else {
                if send_ready {
                    service_send(&mut keep_going);
                }
                if notify_ready {
                    service_notify(&mut keep_going);
                }
            }
            if !keep_going {
                return;
            }
            if hup && !notify_ready && !send_ready {
                return;
            }
        }
    }

    fn drain_notifications(&self, payload: &Payload) {
        // Safety: see `new`.
        let pending = unsafe { (*self.mask).swap(0, Ordering::SeqCst) };
        for ch in 0..64u32 {
            if pending & (1 << ch) != 0 {
                // Safety: the payload ABI promises `microkit_notified` is
                // safe to call with any channel id the runtime dispatches.
                unsafe { (payload.notified)(ch) };
            }
        }
    }

    fn service_one_request(&self, payload: &Payload) -> bool {
        let mut record = [0u8; REQUEST_LEN];
        // Safety: `send_rx` is owned by the manifest for this process's
        // lifetime.
        let fd = unsafe { BorrowedFd::borrow_raw(self.send_rx) };
        match read(fd, &mut record) {
            Ok(0) => return false,
            Ok(n) if n == REQUEST_LEN => {}
            Ok(_) => {
                log::error!("short read on ppc request pipe");
                return false;
            }
            Err(e) => {
                log::error!("read on ppc request pipe failed: {e}");
                return false;
            }
        }
        let ch = u64::from_ne_bytes(record[0..8].try_into().unwrap()) as u32;
        let info = u64::from_ne_bytes(record[8..16].try_into().unwrap());
        let send_back = u64::from_ne_bytes(record[16..24].try_into().unwrap()) as RawFd;

        let Some(protected) = payload.protected else {
            log::error!("received a protected procedure call on channel {ch} but this payload exports no microkit_protected");
            std::process::exit(1);
        };
        // Safety: the payload ABI promises `microkit_protected` is safe to
        // call with any channel id and `msginfo` word the runtime dispatches.
        let reply = unsafe { protected(ch, info) };

        // Safety: `send_back` names the caller's own receive pipe, a
        // descriptor that has been open and writable since before this
        // process was spawned.
        let reply_fd = unsafe { BorrowedFd::borrow_raw(send_back) };
        if write(reply_fd, &reply.to_ne_bytes()).is_err() {
            log::warn!("caller on channel {ch} went away before the reply could be delivered");
        }
        true
    }
}
