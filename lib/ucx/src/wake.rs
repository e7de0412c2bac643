// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pollable wake primitive backed by a non-blocking self-pipe.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd;

/// A file descriptor that becomes readable after [`WakeFd::signal`] and stays
/// readable until [`WakeFd::drain`].
#[derive(Debug)]
pub struct WakeFd {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakeFd {
    pub fn new() -> nix::Result<Self> {
        let (read_fd, write_fd) = unistd::pipe()?;
        let wake = Self { read_fd, write_fd };
        for fd in [read_fd, write_fd] {
            let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
            fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        }
        Ok(wake)
    }

    /// Readable end, for `poll(2)`.
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Make the fd readable. A full pipe is already readable, so `EAGAIN` is ignored.
    pub fn signal(&self) {
        loop {
            match unistd::write(self.write_fd, &[1u8]) {
                Ok(_) | Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(fd = self.write_fd, "failed to signal wake fd: {e}");
                    return;
                }
            }
        }
    }

    /// Consume all pending signals. Returns true if at least one was pending.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut drained = false;
        loop {
            match unistd::read(self.read_fd, &mut buf) {
                Ok(0) => return drained,
                Ok(_) => drained = true,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return drained,
                Err(e) => {
                    tracing::warn!(fd = self.read_fd, "failed to drain wake fd: {e}");
                    return drained;
                }
            }
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        for fd in [self.read_fd, self.write_fd] {
            if let Err(e) = unistd::close(fd) {
                tracing::debug!(fd, "failed to close wake fd: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{PollFd, PollFlags, poll};

    fn readable(wake: &WakeFd) -> bool {
        let mut fds = [PollFd::new(wake.fd(), PollFlags::POLLIN)];
        poll(&mut fds, 0).unwrap() == 1
    }

    #[test]
    fn test_signal_then_drain() {
        let wake = WakeFd::new().unwrap();
        assert!(!readable(&wake));
        assert!(!wake.drain());

        wake.signal();
        wake.signal();
        assert!(readable(&wake));

        assert!(wake.drain());
        assert!(!readable(&wake));
    }

    #[test]
    fn test_signal_never_blocks_when_full() {
        let wake = WakeFd::new().unwrap();
        for _ in 0..200_000 {
            wake.signal();
        }
        assert!(wake.drain());
        assert!(!readable(&wake));
    }
}
