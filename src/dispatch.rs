//! Completion dispatch
//!
//! Hardware callbacks (vsync, hotplug, refresh) arrive on threads owned by the
//! graphics stack. They never touch backend state directly: the device holds
//! an [`EventSink`] that queues a [`HwEvent`] and wakes an eventfd. The thread
//! that owns the backend drains the queue (`Backend::handle_events`, or the
//! blocking waits inside synchronous commit/vblank) and only then are the
//! front end's handlers invoked, so they always run on the owner thread.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::output::{ConnectionStatus, Output, OutputId};

/// Opaque value threaded from a request to the event that completes it.
pub type UserData = u64;

/// Invoked when a committed frame has been displayed.
pub type CommitHandler = Box<dyn FnMut(&FrameEvent) + Send>;

/// Invoked when a requested vblank interval has elapsed.
pub type VblankHandler = Box<dyn FnMut(&FrameEvent) + Send>;

/// Invoked when an output is plugged or unplugged.
pub type StatusHandler = Box<dyn FnMut(OutputId, ConnectionStatus) + Send>;

/// Signals raised by the composition device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwEvent {
    Vsync { display: usize, timestamp_ns: u64 },
    Hotplug { display: usize, connected: bool },
    Refresh { display: usize },
}

/// CLOCK_MONOTONIC time, split the way the front end consumes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: u32,
    pub usec: u32,
}

impl Timestamp {
    pub fn from_nanos(ns: u64) -> Self {
        Self {
            sec: (ns / 1_000_000_000) as u32,
            usec: ((ns % 1_000_000_000) / 1_000) as u32,
        }
    }

    pub fn now() -> Self {
        Self::from_nanos(monotonic_nanos())
    }
}

/// Current CLOCK_MONOTONIC in nanoseconds; vsync timestamps use the same clock.
pub fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Delivered to commit and vblank handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEvent {
    pub output: OutputId,
    pub sequence: u32,
    pub timestamp: Timestamp,
    pub user_data: UserData,
}

/// Producer side of the event queue, safe to call from any thread.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<HwEvent>,
    wake: Arc<OwnedFd>,
}

impl EventSink {
    pub fn send(&self, event: HwEvent) {
        if self.tx.send(event).is_err() {
            trace!(?event, "backend gone, dropping hardware event");
            return;
        }
        let one: u64 = 1;
        // A full counter still leaves the fd readable, so the result does not matter.
        unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("wake_fd", &self.wake.as_raw_fd())
            .finish()
    }
}

/// Consumer side, owned by the backend.
pub(crate) struct EventQueue {
    rx: Receiver<HwEvent>,
    sink: EventSink,
}

impl EventQueue {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake = Arc::new(unsafe { OwnedFd::from_raw_fd(fd) });
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            rx,
            sink: EventSink { tx, wake },
        })
    }

    pub(crate) fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sink.wake.as_raw_fd()
    }

    /// Reset the eventfd counter. Called before draining so a send racing
    /// with the drain leaves the fd readable.
    pub(crate) fn clear_wake(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    pub(crate) fn try_next(&self) -> Option<HwEvent> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn next_timeout(&self, timeout: Duration) -> Option<HwEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// A pending `wait_vblank` request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VblankWait {
    pub(crate) id: u64,
    pub(crate) remaining: u32,
    pub(crate) user_data: UserData,
}

/// Hand a finished commit to the output's commit handler.
///
/// Without a handler the completion is dropped: vsync and commit are not
/// strictly correlated on every device, so stray completions are expected.
pub(crate) fn fire_commit(output: &mut Output, event: &FrameEvent) {
    match output.commit_handler.as_mut() {
        Some(handler) => {
            trace!(output = ?event.output, sequence = event.sequence, "commit done");
            handler(event);
        }
        None => trace!(output = ?event.output, "commit done, no handler registered"),
    }
}

/// Count down pending vblank waits and fire the ones that are due.
pub(crate) fn fire_vblanks(output: &mut Output, sequence: u32, timestamp: Timestamp) {
    if output.vblank_waits.is_empty() {
        return;
    }

    let mut due = Vec::new();
    output.vblank_waits.retain_mut(|wait| {
        wait.remaining = wait.remaining.saturating_sub(1);
        if wait.remaining == 0 {
            due.push(wait.user_data);
            false
        } else {
            true
        }
    });

    let id = output.id();
    for user_data in due {
        let event = FrameEvent {
            output: id,
            sequence,
            timestamp,
            user_data,
        };
        match output.vblank_handler.as_mut() {
            Some(handler) => handler(&event),
            None => trace!(output = ?id, "vblank due, no handler registered"),
        }
    }
}

/// Record a hotplug and tell the front end if the status really changed.
pub(crate) fn fire_hotplug(output: &mut Output, connected: bool) {
    let status = if connected {
        ConnectionStatus::Connected
    } else {
        ConnectionStatus::Disconnected
    };
    if output.status == status {
        debug!(output = ?output.id(), ?status, "hotplug without status change");
        return;
    }

    info!(output = ?output.id(), ?status, "output connection changed");
    output.status = status;
    let id = output.id();
    if let Some(handler) = output.status_handler.as_mut() {
        handler(id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_split() {
        let ts = Timestamp::from_nanos(3_000_250_999);
        assert_eq!(ts, Timestamp { sec: 3, usec: 250 });
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_sink_wakes_queue() {
        let queue = EventQueue::new().unwrap();
        let sink = queue.sink();

        let handle = std::thread::spawn(move || {
            sink.send(HwEvent::Refresh { display: 1 });
        });
        handle.join().unwrap();

        let mut pfd = libc::pollfd {
            fd: queue.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 1);

        queue.clear_wake();
        assert_eq!(queue.try_next(), Some(HwEvent::Refresh { display: 1 }));
        assert_eq!(queue.try_next(), None);
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 0);
    }

    #[test]
    fn test_next_timeout_expires() {
        let queue = EventQueue::new().unwrap();
        assert_eq!(queue.next_timeout(Duration::from_millis(2)), None);
    }
}
