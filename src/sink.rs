// SPDX-License-Identifier: Apache-2.0 OR MIT
// Sink interface and the file-descriptor sink

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use crate::message::Message;
use crate::pool;
use crate::site::CallSite;

/// Destination for emitted messages.
///
/// Sinks may discard, reroute or transform messages; fast-path
/// filtering has already happened at the call site by the time `emit`
/// runs. The site is passed by reference (records live for the whole
/// process) and the message by move.
pub trait Sink: Send + Sync {
    fn emit(&self, site: &'static CallSite, message: Message);
}

/// Shared handle to a sink, cheap to clone and to install into call
/// sites.
pub type SinkRef = Arc<Box<dyn Sink>>;

/// Wrap a sink into a shareable handle.
pub fn sink_ref<S: Sink + 'static>(sink: S) -> SinkRef {
    Arc::new(Box::new(sink))
}

/// Sink that drops every message.
pub struct NullSink;

impl Sink for NullSink {
    fn emit(&self, _site: &'static CallSite, message: Message) {
        drop(message);
    }
}

enum FdTarget {
    Stdout,
    Stderr,
    Owned(OwnedFd),
}

/// Emit rendered message text to a file descriptor.
///
/// Each message is rendered into a pooled buffer followed by a newline
/// and written with a single `write(2)`, so steady-state emission does
/// not allocate. A failed write produces one diagnostic line on
/// standard error; the producer is never informed.
pub struct FdSink {
    target: FdTarget,
}

impl FdSink {
    pub fn stdout() -> Self {
        FdSink {
            target: FdTarget::Stdout,
        }
    }

    pub fn stderr() -> Self {
        FdSink {
            target: FdTarget::Stderr,
        }
    }

    /// Take ownership of an open descriptor; it is closed on drop.
    pub fn from_fd(fd: OwnedFd) -> Self {
        FdSink {
            target: FdTarget::Owned(fd),
        }
    }

    /// Open (or create) `path` for appending.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FdSink::from_fd(OwnedFd::from(file)))
    }

    fn raw_fd(&self) -> RawFd {
        match &self.target {
            FdTarget::Stdout => libc::STDOUT_FILENO,
            FdTarget::Stderr => libc::STDERR_FILENO,
            FdTarget::Owned(fd) => fd.as_raw_fd(),
        }
    }

    fn write_all(&self, mut bytes: &[u8]) -> io::Result<()> {
        let fd = self.raw_fd();
        while !bytes.is_empty() {
            let written =
                unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
            if written < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            bytes = &bytes[written as usize..];
        }
        Ok(())
    }
}

impl Sink for FdSink {
    fn emit(&self, _site: &'static CallSite, message: Message) {
        let mut buf = pool::global().acquire(256);
        // PooledBuf's fmt::Write never fails.
        let _ = writeln!(buf, "{}", message);
        if let Err(err) = self.write_all(buf.as_slice()) {
            eprintln!("relog: write failed on fd {}: {}", self.raw_fd(), err);
        }
    }
}
