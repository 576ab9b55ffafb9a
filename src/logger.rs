//! The logging runtime: staging buffer registry, thread-local fast path,
//! and the background compression thread.
//!
//! There is one `Runtime` per process, created on first use. Every thread
//! that logs gets its own `StagingBuffer`, registered here and drained by a
//! single background thread that compresses staged entries and writes them
//! to the output file through `LogFile`. Shutdown and `sync` are barriers
//! coordinated over two condition variables: `work_added` pokes the
//! background thread, `hint_queue_emptied` reports a fully drained pass
//! back to waiters.

use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use log::error;
use parking_lot::{Condvar, Mutex};

use crate::config::{
    DEFAULT_LOG_FILE, FILE_ALIGNMENT_BYTES, OUTPUT_BUFFER_SIZE, POLL_INTERVAL_BYTES,
    POLL_INTERVAL_NO_WORK_US,
};
use crate::cycles;
use crate::generated::{self, EntryHeader, LogSite, MAX_COMPRESSION_SLACK, STAGED_HEADER_BYTES};
use crate::staging::StagingBuffer;
use crate::writer::{LogFile, WritePoll};

lazy_static! {
    static ref RUNTIME: Arc<Runtime> = Runtime::start();
}

fn runtime() -> &'static Arc<Runtime> {
    &RUNTIME
}

struct Registry {
    buffers: Vec<Arc<StagingBuffer>>,
    next_buffer_id: u32,
}

/// Flags and handoff slots shared between the user API and the background
/// thread, all guarded by `Runtime::cond`.
struct Coordination {
    /// Count of sync requests issued; each waiter waits on its own count.
    syncs_requested: u64,
    /// Highest request count for which a fully drained, fsynced pass has
    /// finished. A pass may only complete requests it observed before it
    /// began scanning.
    syncs_completed: u64,
    should_exit: bool,
    exited: bool,
    pending_log_file: Option<File>,
}

#[derive(Default)]
struct Metrics {
    cycles_awake: AtomicU64,
    cycles_compressing: AtomicU64,
    cycles_scanning_and_compressing: AtomicU64,
    cycles_aio_and_fsync: AtomicU64,
    total_bytes_read: AtomicU64,
    total_bytes_written: AtomicU64,
    pad_bytes_written: AtomicU64,
    events_processed: AtomicU64,
    num_writes_completed: AtomicU64,
    write_errors: AtomicU64,
}

struct Runtime {
    registry: Mutex<Registry>,
    cond: Mutex<Coordination>,
    work_added: Condvar,
    hint_queue_emptied: Condvar,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    metrics: Metrics,
}

impl Runtime {
    fn start() -> Arc<Runtime> {
        let rt = Arc::new(Runtime {
            registry: Mutex::new(Registry { buffers: vec![], next_buffer_id: 0 }),
            cond: Mutex::new(Coordination {
                syncs_requested: 0,
                syncs_completed: 0,
                should_exit: false,
                exited: false,
                pending_log_file: None,
            }),
            work_added: Condvar::new(),
            hint_queue_emptied: Condvar::new(),
            worker: Mutex::new(None),
            metrics: Metrics::default(),
        });

        let handle = thread::Builder::new()
            .name("log-compression".into())
            .spawn({
                let rt = rt.clone();
                move || compression_thread_main(rt)
            })
            .expect("failed to spawn log compression thread");

        *rt.worker.lock() = Some(handle);
        rt
    }

    /// Allocates and registers this thread's staging buffer. Only the id
    /// assignment and the list splice hold the registry lock; the megabyte
    /// allocation happens between the two critical sections.
    fn ensure_staging_buffer(&self) -> *const StagingBuffer {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_buffer_id;
            registry.next_buffer_id += 1;
            id
        };

        let buffer = Arc::new(StagingBuffer::new(id));
        self.registry.lock().buffers.push(buffer.clone());

        let raw = Arc::as_ptr(&buffer);
        STAGING_PTR.with(|p| p.set(raw));
        STAGING_GUARD.with(|g| *g.borrow_mut() = Some(StagingGuard { buffer }));
        raw
    }

    fn shutdown_inner(&self) {
        {
            let mut cond = self.cond.lock();
            cond.should_exit = true;
            self.work_added.notify_all();
            while !cond.exited {
                self.work_added.notify_all();
                let _ = self
                    .hint_queue_emptied
                    .wait_for(&mut cond, Duration::from_millis(100));
            }
        }

        if let Some(handle) = self.worker.lock().take() {
            if let Err(e) = handle.join() {
                error!("error joining log compression thread: {:?}", e);
            }
        }
    }
}

/// Keeps the thread's buffer alive and, on thread exit, marks it so the
/// background thread reclaims it once drained. A plain pointer carries the
/// fast path; this guard only exists for its destructor.
struct StagingGuard {
    buffer: Arc<StagingBuffer>,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        self.buffer.mark_for_deallocation();
        let _ = STAGING_PTR.try_with(|p| p.set(ptr::null()));
    }
}

thread_local! {
    static STAGING_PTR: Cell<*const StagingBuffer> = const { Cell::new(ptr::null()) };
    static STAGING_GUARD: RefCell<Option<StagingGuard>> = const { RefCell::new(None) };
}

#[inline]
fn local_buffer() -> *const StagingBuffer {
    let raw = STAGING_PTR.with(|p| p.get());
    if !raw.is_null() {
        return raw;
    }
    runtime().ensure_staging_buffer()
}

/// Reserves space in the calling thread's staging buffer for one record.
/// Invoked by generated code; pair every call with `finish_alloc` of the
/// same size before reserving again. Blocks while the buffer is full.
#[inline]
#[allow(unsafe_code)]
pub fn reserve_alloc(nbytes: usize) -> *mut u8 {
    let buffer = local_buffer();
    unsafe { (*buffer).reserve_producer_space(nbytes) }
}

/// Publishes the bytes reserved by the matching `reserve_alloc` to the
/// compression thread.
#[inline]
#[allow(unsafe_code)]
pub fn finish_alloc(nbytes: usize) {
    STAGING_PTR.with(|p| {
        let raw = p.get();
        debug_assert!(!raw.is_null(), "finish_alloc without a reservation");
        if !raw.is_null() {
            unsafe { (*raw).finish_reservation(nbytes) }
        }
    });
}

/// Stages one complete record: the shared entry header followed by the raw
/// argument bytes the call site's compressor understands. This is the
/// reference encoder generated code follows.
#[allow(unsafe_code)]
pub fn stage_record(log_id: u32, args: &[u8]) {
    let total = STAGED_HEADER_BYTES + args.len();
    let header = EntryHeader {
        log_id,
        size: total as u32,
        timestamp: cycles::rdtsc(),
    };

    let raw = reserve_alloc(total);
    let buf = unsafe { slice::from_raw_parts_mut(raw, total) };
    header.encode(buf);
    buf[STAGED_HEADER_BYTES..].copy_from_slice(args);
    finish_alloc(total);
}

/// Eagerly creates the calling thread's staging buffer so the first log
/// statement does not pay for the allocation.
pub fn preallocate() {
    let _ = local_buffer();
}

/// Retargets log output to `path`, truncating it. Everything staged before
/// the call is flushed to the previous file first; returns an error if the
/// new file cannot be opened.
pub fn set_log_file<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;

    let rt = runtime();

    // Drain and flush against the current file before swapping.
    sync();

    let mut cond = rt.cond.lock();
    cond.pending_log_file = Some(file);
    rt.work_added.notify_all();
    while cond.pending_log_file.is_some() && !cond.exited {
        rt.hint_queue_emptied.wait(&mut cond);
    }
    Ok(())
}

/// Blocks until every record committed before this call has been
/// compressed, written out, and fsynced.
pub fn sync() {
    let rt = runtime();
    let mut cond = rt.cond.lock();
    if cond.exited {
        return;
    }
    cond.syncs_requested += 1;
    let target = cond.syncs_requested;
    rt.work_added.notify_all();
    while cond.syncs_completed < target && !cond.exited {
        rt.hint_queue_emptied.wait(&mut cond);
    }
}

/// Stops the background thread after a final drain, fsyncs, and joins it.
/// The caller is responsible for making sure no thread logs after this.
pub fn shutdown() {
    runtime().shutdown_inner();
}

/// Snapshot of the runtime's counters. Values are written by the
/// background thread with relaxed ordering; a snapshot taken while it runs
/// may be slightly stale but never torn per-field.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub events_processed: u64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub pad_bytes_written: u64,
    pub num_writes_completed: u64,
    pub write_errors: u64,
}

/// Reads the current metric counters.
pub fn stats() -> Stats {
    let m = &runtime().metrics;
    Stats {
        events_processed: m.events_processed.load(Relaxed),
        total_bytes_read: m.total_bytes_read.load(Relaxed),
        total_bytes_written: m.total_bytes_written.load(Relaxed),
        pad_bytes_written: m.pad_bytes_written.load(Relaxed),
        num_writes_completed: m.num_writes_completed.load(Relaxed),
        write_errors: m.write_errors.load(Relaxed),
    }
}

/// Prints the metric counters and per-buffer producer stall times to
/// stdout.
pub fn print_stats() {
    let rt = runtime();
    let m = &rt.metrics;
    let s = stats();

    println!("==== statistics ====");
    println!("events processed:        {}", s.events_processed);
    println!(
        "bytes read from staging: {}",
        s.total_bytes_read
    );
    println!(
        "bytes written to disk:   {} ({} padding)",
        s.total_bytes_written, s.pad_bytes_written
    );
    println!("writes completed:        {}", s.num_writes_completed);
    println!("write errors:            {}", s.write_errors);
    println!(
        "time awake:              {:.6} s",
        cycles::to_seconds(m.cycles_awake.load(Relaxed))
    );
    println!(
        "time scanning buffers:   {:.6} s",
        cycles::to_seconds(m.cycles_scanning_and_compressing.load(Relaxed))
    );
    println!(
        "time compressing:        {:.6} s",
        cycles::to_seconds(m.cycles_compressing.load(Relaxed))
    );
    println!(
        "time in io and fsync:    {:.6} s",
        cycles::to_seconds(m.cycles_aio_and_fsync.load(Relaxed))
    );
    if s.events_processed > 0 {
        println!(
            "output bytes per event:  {:.2}",
            s.total_bytes_written as f64 / s.events_processed as f64
        );
    }

    let buffers = rt.registry.lock().buffers.clone();
    for b in buffers {
        println!(
            "buffer {}: producer blocked {:.6} s",
            b.id(),
            cycles::to_seconds(b.cycles_producer_blocked())
        );
    }
}

fn compression_thread_main(rt: Arc<Runtime>) {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(DEFAULT_LOG_FILE)
        .and_then(LogFile::new)
        .unwrap_or_else(|e| {
            eprintln!("could not open log file {}: {}", DEFAULT_LOG_FILE, e);
            std::process::exit(-1);
        });

    Worker {
        rt,
        // room for alignment padding past the fill limit
        out: Vec::with_capacity(OUTPUT_BUFFER_SIZE + FILE_ALIGNMENT_BYTES),
        spare: Vec::with_capacity(OUTPUT_BUFFER_SIZE + FILE_ALIGNMENT_BYTES),
        file,
    }
    .run()
}

struct Worker {
    rt: Arc<Runtime>,
    /// Buffer currently accumulating compressed records.
    out: Vec<u8>,
    /// The sibling buffer; holds the bytes of the write in flight.
    spare: Vec<u8>,
    file: LogFile,
}

impl Worker {
    fn run(mut self) {
        loop {
            let pass_start = cycles::rdtsc();

            let new_file = self.rt.cond.lock().pending_log_file.take();
            if let Some(file) = new_file {
                self.retarget(file);
                self.rt.hint_queue_emptied.notify_all();
            }

            // Snapshot before scanning. An empty pass can only vouch for
            // sync requests and exit signals that were already visible when
            // the scan began: a record committed before such a request is
            // visible to every peek in this pass (both sides cross the
            // cond mutex), while a request arriving mid-scan must wait for
            // the next pass.
            let (sync_target, sync_pending, should_exit) = {
                let cond = self.rt.cond.lock();
                (
                    cond.syncs_requested,
                    cond.syncs_completed < cond.syncs_requested,
                    cond.should_exit,
                )
            };

            let bytes_read = self.drain_pass();
            self.reap_if_done();

            if !self.out.is_empty()
                && (self.out.len() >= POLL_INTERVAL_BYTES || sync_pending || should_exit)
            {
                self.rotate();
            }

            self.rt
                .metrics
                .cycles_scanning_and_compressing
                .fetch_add(cycles::rdtsc().wrapping_sub(pass_start), Relaxed);

            if bytes_read == 0 {
                if self.file.has_outstanding() {
                    // no new input; finish the write in flight instead
                    self.wait_for_write();
                    continue;
                }

                let mut cond = self.rt.cond.lock();
                if self.out.is_empty() {
                    if cond.syncs_completed < sync_target {
                        // everything committed before these requests
                        // predates this empty scan and has been written
                        // out; the fsync makes it durable
                        let io_start = cycles::rdtsc();
                        if let Err(e) = self.file.datasync() {
                            self.rt.metrics.write_errors.fetch_add(1, Relaxed);
                            error!("log fsync failed: {}", e);
                        }
                        self.rt
                            .metrics
                            .cycles_aio_and_fsync
                            .fetch_add(cycles::rdtsc().wrapping_sub(io_start), Relaxed);
                        cond.syncs_completed = sync_target;
                    }
                    self.rt.hint_queue_emptied.notify_all();
                    if should_exit {
                        break;
                    }
                }

                self.rt
                    .metrics
                    .cycles_awake
                    .fetch_add(cycles::rdtsc().wrapping_sub(pass_start), Relaxed);
                let _ = self.rt.work_added.wait_for(
                    &mut cond,
                    Duration::from_micros(POLL_INTERVAL_NO_WORK_US),
                );
            } else {
                self.rt
                    .metrics
                    .cycles_awake
                    .fetch_add(cycles::rdtsc().wrapping_sub(pass_start), Relaxed);
            }
        }

        // Fully drained; make the tail durable before exiting.
        if let Err(e) = self.file.datasync() {
            error!("final log fsync failed: {}", e);
        }

        let mut cond = self.rt.cond.lock();
        cond.exited = true;
        drop(cond);
        self.rt.hint_queue_emptied.notify_all();
    }

    /// One pass over every registered staging buffer. Returns the number of
    /// staged bytes drained.
    #[allow(unsafe_code)]
    fn drain_pass(&mut self) -> usize {
        let buffers = { self.rt.registry.lock().buffers.clone() };
        let sites = generated::installed();
        let mut bytes_read = 0;

        for buffer in &buffers {
            // at most two spans per buffer: before and after a wrap
            for _ in 0..2 {
                let (raw, len) = buffer.peek();
                if len == 0 {
                    if buffer.can_delete() {
                        self.unregister(buffer.id());
                    }
                    break;
                }

                let span = unsafe { slice::from_raw_parts(raw, len) };
                let consumed = self.compress_span(buffer, span, sites);
                bytes_read += consumed;
                if consumed < len {
                    break;
                }
            }
        }

        bytes_read
    }

    /// Compresses as many complete staged entries as fit from `span`,
    /// releasing each back to the producer as it goes. Returns bytes
    /// consumed.
    fn compress_span(
        &mut self,
        buffer: &StagingBuffer,
        span: &[u8],
        sites: &[LogSite],
    ) -> usize {
        let start = cycles::rdtsc();
        let mut cursor = span;
        let mut consumed = 0;

        while cursor.len() >= STAGED_HEADER_BYTES {
            let header = EntryHeader::decode(cursor);
            let size = header.size as usize;
            debug_assert!(size >= STAGED_HEADER_BYTES, "corrupt staged entry header");
            if size < STAGED_HEADER_BYTES || size > cursor.len() {
                // commits are whole records, so a short span means the
                // staging protocol was violated; stop rather than misparse
                break;
            }

            let worst_case = 4 + (size - STAGED_HEADER_BYTES) + MAX_COMPRESSION_SLACK;
            if self.out.len() + worst_case > OUTPUT_BUFFER_SIZE {
                self.rotate();
                if self.out.len() + worst_case > OUTPUT_BUFFER_SIZE {
                    break;
                }
            }

            let id = header.log_id as usize;
            if id >= sites.len() {
                debug_assert!(false, "staged entry with unknown log id {}", header.log_id);
                error!("dropping staged entry with unknown log id {}", header.log_id);
            } else {
                self.out.extend_from_slice(&(header.log_id + 1).to_le_bytes());
                (sites[id].compress)(
                    header.timestamp,
                    &cursor[STAGED_HEADER_BYTES..size],
                    &mut self.out,
                );
                self.rt.metrics.events_processed.fetch_add(1, Relaxed);
            }

            buffer.consume(size);
            consumed += size;
            cursor = &cursor[size..];
        }

        self.rt.metrics.total_bytes_read.fetch_add(consumed as u64, Relaxed);
        self.rt
            .metrics
            .cycles_compressing
            .fetch_add(cycles::rdtsc().wrapping_sub(start), Relaxed);
        consumed
    }

    /// Submits the current output buffer and swaps in the idle one. Waits
    /// out any previous write first so only one request is ever in flight.
    #[allow(unsafe_code)]
    fn rotate(&mut self) {
        if self.out.is_empty() {
            return;
        }
        self.wait_for_write();

        let len = self.out.len();
        let mut padded = round_up(len, FILE_ALIGNMENT_BYTES);
        // a pad shorter than a record prefix would let the decoder's
        // four-byte read straddle into the next submission
        if padded - len > 0 && padded - len < 4 {
            padded += FILE_ALIGNMENT_BYTES;
        }
        self.rt
            .metrics
            .pad_bytes_written
            .fetch_add((padded - len) as u64, Relaxed);
        self.out.resize(padded, 0);

        let io_start = cycles::rdtsc();
        // the buffer swap below keeps the submitted allocation untouched
        // until the next wait_for_write
        let submitted = unsafe { self.file.submit(&self.out) };
        self.rt
            .metrics
            .cycles_aio_and_fsync
            .fetch_add(cycles::rdtsc().wrapping_sub(io_start), Relaxed);

        match submitted {
            Ok(()) => {
                std::mem::swap(&mut self.out, &mut self.spare);
                self.out.clear();
            }
            Err(e) => {
                self.rt.metrics.write_errors.fetch_add(1, Relaxed);
                error!("could not submit log write: {}", e);
                self.out.clear();
            }
        }
    }

    fn wait_for_write(&mut self) {
        if !self.file.has_outstanding() {
            return;
        }
        let io_start = cycles::rdtsc();
        let result = self.file.wait();
        self.rt
            .metrics
            .cycles_aio_and_fsync
            .fetch_add(cycles::rdtsc().wrapping_sub(io_start), Relaxed);
        self.account_write(result);
    }

    fn reap_if_done(&mut self) {
        if let WritePoll::Done(result) = self.file.poll() {
            self.account_write(result);
        }
    }

    fn account_write(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => {}
            Ok(n) => {
                self.rt.metrics.total_bytes_written.fetch_add(n as u64, Relaxed);
                self.rt.metrics.num_writes_completed.fetch_add(1, Relaxed);
            }
            Err(e) => {
                self.rt.metrics.write_errors.fetch_add(1, Relaxed);
                error!("async log write failed: {}", e);
            }
        }
    }

    /// Applies a pending output retarget. The caller drained us via `sync`
    /// before queueing the new file.
    fn retarget(&mut self, file: File) {
        self.wait_for_write();
        if let Err(e) = self.file.datasync() {
            error!("fsync of previous log file failed: {}", e);
        }
        self.file.retarget(file);
    }

    fn unregister(&mut self, id: u32) {
        let mut registry = self.rt.registry.lock();
        registry.buffers.retain(|b| b.id() != id);
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}
