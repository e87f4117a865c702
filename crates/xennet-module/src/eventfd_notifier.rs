//! `EventFdNotifier`: default `Notifier` implementation on Linux.
//!
//! Writes to an eventfd to wake the peer's event loop.
//! Coalescing: multiple calls to `notify()` before the consumer
//! reads the eventfd result in a single wakeup (eventfd counter semantics).

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;

use xennet_core::error::{NetfrontError, Result};
use xennet_core::notifier::Notifier;

use crate::EventWait;

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Create a new non-blocking eventfd. The notifier owns the fd and
    /// closes it on Drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NetfrontError::Os(Errno::last() as i32));
        }
        Ok(Self { fd })
    }

    /// Raw descriptor, for an external poll loop.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Consume pending notifications without blocking.
    /// Returns how many were coalesced into the counter (0 if none).
    pub fn drain(&self) -> Result<u64> {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            if errno == Errno::EAGAIN {
                return Ok(0);
            }
            return Err(NetfrontError::Os(errno as i32));
        }
        Ok(val)
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            // EAGAIN: the counter would overflow, a wakeup is already pending.
            if errno == Errno::EAGAIN {
                return Ok(());
            }
            return Err(NetfrontError::Os(errno as i32));
        }
        Ok(())
    }
}

impl EventWait for EventFdNotifier {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        if self.drain()? > 0 {
            return Ok(true);
        }
        let mut pfd = libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 };
        let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                return Ok(false);
            }
            return Err(NetfrontError::Os(errno as i32));
        }
        Ok(ret > 0 && self.drain()? > 0)
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}
