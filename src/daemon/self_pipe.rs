//! Termination self-pipe
//!
//! The OS signal handler may only perform async-signal-safe work, so it writes
//! a single byte into a non-blocking pipe. The read end is registered with the
//! runtime and the daemon loop wakes on it.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Write end used by the signal handler, -1 when no handler is installed
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const TERMINATION_SIGNALS: [libc::c_int; 2] = [libc::SIGTERM, libc::SIGINT];

extern "C" fn on_termination(_signal: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = 1;
        // SAFETY: write(2) is async-signal-safe; a full pipe already holds a
        // pending wakeup so a failed write is harmless.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl calls on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_handler(signal: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: the action is fully initialised before being installed and the
    // handler only touches an atomic and write(2).
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read everything currently buffered. `WouldBlock` when the pipe was empty.
fn drain(fd: RawFd) -> io::Result<usize> {
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        // SAFETY: reading into a stack buffer of the given length.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            total += n as usize;
            continue;
        }
        if n == 0 {
            return Ok(total);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock if total > 0 => return Ok(total),
            _ => return Err(err),
        }
    }
}

pub struct SelfPipe {
    read: AsyncFd<OwnedFd>,
    write: OwnedFd,
    handlers_installed: bool,
}

impl SelfPipe {
    /// Must be called from within the runtime.
    pub fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        // SAFETY: fds has room for the two descriptors pipe(2) returns.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned here.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_nonblocking_cloexec(read.as_raw_fd())?;
        set_nonblocking_cloexec(write.as_raw_fd())?;

        Ok(Self {
            read: AsyncFd::new(read)?,
            write,
            handlers_installed: false,
        })
    }

    /// Route SIGTERM and SIGINT into this pipe.
    pub fn install_termination_handlers(&mut self) -> io::Result<()> {
        WRITE_FD.store(self.write.as_raw_fd(), Ordering::SeqCst);
        let handler = on_termination as extern "C" fn(libc::c_int) as libc::sighandler_t;
        for signal in TERMINATION_SIGNALS {
            set_handler(signal, handler)?;
        }
        self.handlers_installed = true;
        debug!("Termination signal handlers installed");
        Ok(())
    }

    /// A handle that wakes the loop the same way a termination signal does.
    pub fn notifier(&self) -> io::Result<Notifier> {
        Ok(Notifier {
            file: File::from(self.write.try_clone()?),
        })
    }

    /// Wait until at least one notification is pending and consume all of
    /// them. Returns how many were consumed.
    pub async fn wait(&self) -> io::Result<usize> {
        loop {
            let mut guard = self.read.readable().await?;
            match guard.try_io(|fd| drain(fd.get_ref().as_raw_fd())) {
                Ok(Ok(0)) => continue,
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        if self.handlers_installed {
            for signal in TERMINATION_SIGNALS {
                let _ = set_handler(signal, libc::SIG_DFL);
            }
            let _ = WRITE_FD.compare_exchange(
                self.write.as_raw_fd(),
                -1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

pub struct Notifier {
    file: File,
}

impl Notifier {
    pub fn notify(&self) -> io::Result<()> {
        match (&self.file).write(&[1]) {
            Ok(_) => Ok(()),
            // Pipe full, a wakeup is already pending
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}
