//! Sync fences handed out by the composition device
//!
//! A fence is a file descriptor that becomes readable once the hardware
//! operation it guards has finished. A missing descriptor (`-1` on the HAL
//! side) means the operation is already complete.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use tracing::trace;

/// Owned sync fence. Dropping it closes the descriptor.
#[derive(Debug, Default)]
pub struct Fence(Option<OwnedFd>);

/// Outcome of a bounded fence wait.
#[derive(Debug)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

impl Fence {
    /// A fence that is already satisfied.
    pub const fn none() -> Self {
        Self(None)
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self(Some(fd))
    }

    /// Take ownership of a descriptor returned by the HAL.
    ///
    /// # Safety
    /// `fd` must be either negative or an open descriptor nobody else owns.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        if fd < 0 {
            Self(None)
        } else {
            Self(Some(OwnedFd::from_raw_fd(fd)))
        }
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Raw descriptor, `-1` for an absent fence.
    pub fn as_raw(&self) -> RawFd {
        self.0.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    /// Hand the descriptor over to the HAL, which becomes responsible for closing it.
    pub fn into_raw(self) -> RawFd {
        self.0.map_or(-1, |fd| fd.into_raw_fd())
    }

    /// Move the fence out, leaving an absent one behind.
    pub fn take(&mut self) -> Fence {
        Fence(self.0.take())
    }

    /// A second descriptor for the same fence.
    pub fn try_clone(&self) -> io::Result<Fence> {
        match self.0.as_ref() {
            Some(fd) => Ok(Fence(Some(fd.try_clone()?))),
            None => Ok(Fence::none()),
        }
    }

    /// Non-blocking check.
    pub fn is_signaled(&self) -> io::Result<bool> {
        match self.wait(Duration::ZERO)? {
            FenceWait::Signaled => Ok(true),
            FenceWait::TimedOut => Ok(false),
        }
    }

    /// Block until the fence signals or `timeout` expires.
    pub fn wait(&self, timeout: Duration) -> io::Result<FenceWait> {
        let Some(fd) = self.0.as_ref() else {
            return Ok(FenceWait::Signaled);
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut pfd = libc::pollfd {
                fd: fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, poll_timeout_ms(remaining)) };

            if ret > 0 {
                if pfd.revents & libc::POLLNVAL != 0 {
                    return Err(io::Error::from_raw_os_error(libc::EBADF));
                }
                trace!(fd = fd.as_raw_fd(), "fence signaled");
                return Ok(FenceWait::Signaled);
            }
            if ret == 0 {
                if remaining.is_zero() {
                    return Ok(FenceWait::TimedOut);
                }
                continue;
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// poll(2) timeout, rounding up so a short remaining wait is not spun as zero.
fn poll_timeout_ms(remaining: Duration) -> libc::c_int {
    let ms = remaining.as_micros().div_ceil(1000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (Fence, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        let read = unsafe { Fence::from_raw(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        (read, write)
    }

    #[test]
    fn test_absent_fence_is_signaled() {
        let fence = Fence::none();
        assert!(fence.is_none());
        assert_eq!(fence.as_raw(), -1);
        assert!(matches!(fence.wait(Duration::ZERO).unwrap(), FenceWait::Signaled));
    }

    #[test]
    fn test_wait_times_out_until_written() {
        let (fence, write) = pipe();
        assert!(!fence.is_signaled().unwrap());
        assert!(matches!(
            fence.wait(Duration::from_millis(5)).unwrap(),
            FenceWait::TimedOut
        ));

        let byte = 1u8;
        let n = unsafe { libc::write(write.as_raw_fd(), &byte as *const u8 as *const _, 1) };
        assert_eq!(n, 1);
        assert!(fence.is_signaled().unwrap());
    }

    #[test]
    fn test_negative_raw_is_absent() {
        let fence = unsafe { Fence::from_raw(-1) };
        assert!(fence.is_none());
        assert_eq!(fence.into_raw(), -1);
    }

    #[test]
    fn test_take_leaves_none() {
        let (mut fence, _write) = pipe();
        let taken = fence.take();
        assert!(fence.is_none());
        assert!(!taken.is_none());
    }
}
