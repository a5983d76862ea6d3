//! Self-pipe used to interrupt the dispatcher's `poll(2)`.

use std::io;
use std::os::unix::io::RawFd;

/// A non-blocking pipe. Any thread may [`notify`](Waker::notify); the loop
/// polls [`raw_fd`](Waker::raw_fd) and calls [`drain`](Waker::drain) once woken.
///
/// Wakeups coalesce: several notifications before a drain wake the loop once.
#[derive(Debug)]
pub struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let waker = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        for fd in fds {
            set_nonblocking_cloexec(fd)?;
        }
        Ok(waker)
    }

    /// Make the read end readable. Only calls `write(2)`, so this is safe
    /// from a signal handler.
    pub fn notify(&self) -> io::Result<()> {
        let byte = 1u8;
        let ret = unsafe {
            libc::write(
                self.write_fd,
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Pipe full: a wakeup is already pending
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Consume every pending wakeup. Returns the number of bytes read.
    pub fn drain(&self) -> io::Result<usize> {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            let ret = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret > 0 {
                total += ret as usize;
                continue;
            }
            if ret == 0 {
                return Ok(total);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(total),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
