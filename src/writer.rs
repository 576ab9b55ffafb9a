//! File output with at most one write in flight.
//!
//! The compression thread alternates between two output buffers: while one
//! is being written by the kernel, the other accumulates freshly compressed
//! records. `LogFile` tracks the single outstanding request. With the `aio`
//! feature (the default on Unix) submissions go through POSIX asynchronous
//! IO; otherwise `submit` degrades to a synchronous positioned write that
//! completes immediately.

use std::fs::File;
use std::io;

#[cfg(not(all(feature = "aio", target_family = "unix")))]
use std::io::{Seek, SeekFrom, Write};

/// Completion state of the most recent submission.
pub(crate) enum WritePoll {
    /// No write has been submitted.
    Idle,
    /// The kernel has not finished the write yet.
    Pending,
    /// The write finished; carries bytes written or the failure.
    Done(io::Result<usize>),
}

#[cfg(all(feature = "aio", target_family = "unix"))]
struct InFlight {
    // Boxed so the control block never moves while the kernel holds
    // pointers into it.
    cb: Box<libc::aiocb>,
}

pub(crate) struct LogFile {
    file: File,
    offset: u64,
    #[cfg(all(feature = "aio", target_family = "unix"))]
    in_flight: Option<InFlight>,
    #[cfg(not(all(feature = "aio", target_family = "unix")))]
    finished: Option<usize>,
}

#[cfg(all(feature = "aio", target_family = "unix"))]
#[allow(unsafe_code)]
unsafe impl Send for LogFile {}

impl LogFile {
    /// Wraps an open file, appending after any existing contents.
    pub fn new(file: File) -> io::Result<LogFile> {
        let offset = file.metadata()?.len();
        Ok(LogFile {
            file,
            offset,
            #[cfg(all(feature = "aio", target_family = "unix"))]
            in_flight: None,
            #[cfg(not(all(feature = "aio", target_family = "unix")))]
            finished: None,
        })
    }

    /// Swaps in a different file. The previous one is closed on drop.
    /// Requires that no write is outstanding.
    pub fn retarget(&mut self, file: File) {
        debug_assert!(!self.has_outstanding());
        self.offset = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = file;
    }

    /// Flushes completed writes down to the device.
    pub fn datasync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(all(feature = "aio", target_family = "unix"))]
#[allow(unsafe_code)]
impl LogFile {
    pub fn has_outstanding(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Hands `buf` to the kernel for an asynchronous write at the current
    /// file offset.
    ///
    /// Unsafe contract: `buf` must stay allocated and unmodified until
    /// `poll` returns `Done` or `wait` returns. Requires that no other
    /// write is outstanding.
    pub unsafe fn submit(&mut self, buf: &[u8]) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        debug_assert!(!self.has_outstanding());

        let mut cb: Box<libc::aiocb> = Box::new(std::mem::zeroed());
        cb.aio_fildes = self.file.as_raw_fd();
        cb.aio_buf = buf.as_ptr() as *mut libc::c_void;
        cb.aio_nbytes = buf.len();
        cb.aio_offset = self.offset as libc::off_t;

        if libc::aio_write(&mut *cb) != 0 {
            return Err(io::Error::last_os_error());
        }

        self.offset += buf.len() as u64;
        self.in_flight = Some(InFlight { cb });
        Ok(())
    }

    /// Checks on the outstanding write without blocking.
    pub fn poll(&mut self) -> WritePoll {
        match &self.in_flight {
            None => return WritePoll::Idle,
            Some(op) => {
                if unsafe { libc::aio_error(&*op.cb) } == libc::EINPROGRESS {
                    return WritePoll::Pending;
                }
            }
        }
        let mut op = self.in_flight.take().expect("checked above");
        WritePoll::Done(Self::reap(&mut op))
    }

    /// Blocks until the outstanding write completes. Returns `Ok(0)` when
    /// nothing was in flight.
    pub fn wait(&mut self) -> io::Result<usize> {
        let mut op = match self.in_flight.take() {
            None => return Ok(0),
            Some(op) => op,
        };

        loop {
            if unsafe { libc::aio_error(&*op.cb) } != libc::EINPROGRESS {
                return Self::reap(&mut op);
            }
            let list = [&*op.cb as *const libc::aiocb];
            let rc = unsafe { libc::aio_suspend(list.as_ptr(), 1, std::ptr::null()) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }

    fn reap(op: &mut InFlight) -> io::Result<usize> {
        let err = unsafe { libc::aio_error(&*op.cb) };
        let ret = unsafe { libc::aio_return(&mut *op.cb) };
        if err != 0 {
            Err(io::Error::from_raw_os_error(err))
        } else if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

#[cfg(not(all(feature = "aio", target_family = "unix")))]
#[allow(unsafe_code)]
impl LogFile {
    pub fn has_outstanding(&self) -> bool {
        self.finished.is_some()
    }

    /// Synchronous fallback: performs the write immediately. The result is
    /// still reported through `poll`/`wait` so callers account for
    /// completions the same way in both modes.
    pub unsafe fn submit(&mut self, buf: &[u8]) -> io::Result<()> {
        debug_assert!(!self.has_outstanding());
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.file.write_all(buf)?;
        self.offset += buf.len() as u64;
        self.finished = Some(buf.len());
        Ok(())
    }

    pub fn poll(&mut self) -> WritePoll {
        match self.finished.take() {
            None => WritePoll::Idle,
            Some(n) => WritePoll::Done(Ok(n)),
        }
    }

    pub fn wait(&mut self) -> io::Result<usize> {
        Ok(self.finished.take().unwrap_or(0))
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::io::Read;

    fn scratch_path(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("nanolog_writer_{}_{}", tag, std::process::id()));
        p
    }

    #[test]
    fn submit_wait_appends_at_offset() {
        let path = scratch_path("basic");
        let _ = std::fs::remove_file(&path);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .unwrap();

        let mut log = LogFile::new(file).unwrap();
        let first = vec![1u8; 512];
        let second = vec![2u8; 512];

        unsafe {
            log.submit(&first).unwrap();
        }
        assert_eq!(log.wait().unwrap(), 512);
        unsafe {
            log.submit(&second).unwrap();
        }
        assert_eq!(log.wait().unwrap(), 512);
        assert_eq!(log.wait().unwrap(), 0);
        log.datasync().unwrap();

        let mut contents = vec![];
        std::fs::File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(&contents[..512], &first[..]);
        assert_eq!(&contents[512..], &second[..]);
        let _ = std::fs::remove_file(&path);
    }
}
