//! Contract between the runtime and build-time generated logging code.
//!
//! The runtime itself is ignorant of what any particular log statement
//! carries. A code generator that scans user sources assigns every log call
//! site a dense integer id and emits, per site, an encoder for the staged
//! arguments, a compressor that turns a staged entry into its on-disk
//! payload, and a decompressor that renders that payload back into text.
//! Those land here as a flat table of [`LogSite`] variants indexed by id,
//! registered once at startup with [`install`].
//!
//! Two byte layouts are shared between the generated code and the runtime:
//!
//! * The *staged entry*: a [`STAGED_HEADER_BYTES`]-byte header (`log_id`,
//!   total `size`, `timestamp`, all little-endian) followed by raw argument
//!   bytes, written into a staging buffer by the generated encoder.
//! * The *on-disk record*: a little-endian `u32` equal to `log_id + 1`
//!   (zero marks alignment padding and never a record) followed by the
//!   compressor's payload. The payload is self-describing: the matching
//!   decompressor consumes exactly the bytes its compressor produced, and
//!   its length never exceeds the staged entry size plus
//!   [`MAX_COMPRESSION_SLACK`] bytes.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size in bytes of the header ahead of every staged entry.
pub const STAGED_HEADER_BYTES: usize = 16;

/// Upper bound on how much a compressor may expand a staged entry.
pub const MAX_COMPRESSION_SLACK: usize = 16;

/// Header of one staged (uncompressed) entry in a staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Id of the call site that produced this entry.
    pub log_id: u32,
    /// Total staged size, header included.
    pub size: u32,
    /// Cycle counter captured when the entry was staged.
    pub timestamp: u64,
}

impl EntryHeader {
    /// Serializes the header into the first [`STAGED_HEADER_BYTES`] bytes
    /// of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.log_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
    }

    /// Reads a header back out of `buf`.
    pub fn decode(buf: &[u8]) -> EntryHeader {
        let mut id = [0; 4];
        let mut size = [0; 4];
        let mut ts = [0; 8];
        id.copy_from_slice(&buf[0..4]);
        size.copy_from_slice(&buf[4..8]);
        ts.copy_from_slice(&buf[8..16]);
        EntryHeader {
            log_id: u32::from_le_bytes(id),
            size: u32::from_le_bytes(size),
            timestamp: u64::from_le_bytes(ts),
        }
    }
}

/// Severity recorded in a call site's static metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Notice,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Debug => "DEBUG",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Static facts about one log call site.
#[derive(Debug, Clone, Copy)]
pub struct LogMetadata {
    pub file_name: &'static str,
    pub line_number: u32,
    pub severity: Severity,
    pub fmt_string: &'static str,
}

/// Turns one staged entry (its timestamp plus raw argument bytes) into the
/// on-disk payload, appended to `out`. Output must stay within the staged
/// size plus [`MAX_COMPRESSION_SLACK`].
pub type CompressFn = fn(timestamp: u64, args: &[u8], out: &mut Vec<u8>);

/// Consumes one on-disk payload from the front of `input` and renders the
/// human-readable line into `out`.
pub type DecompressFn =
    fn(input: &mut &[u8], metadata: &LogMetadata, out: &mut dyn Write) -> io::Result<()>;

/// One call-site variant: metadata plus its paired compressor and
/// decompressor. The table index is the call site's id.
pub struct LogSite {
    pub metadata: LogMetadata,
    pub compress: CompressFn,
    pub decompress: DecompressFn,
}

const UNINSTALLED: usize = 0;
const INSTALLING: usize = 1;
const INSTALLED: usize = 2;

static STATE: AtomicUsize = AtomicUsize::new(UNINSTALLED);
static mut SITES: &[LogSite] = &[];

/// Error returned when a site table has already been installed.
#[derive(Debug)]
pub struct InstallError(());

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a generated log site table is already installed")
    }
}

impl std::error::Error for InstallError {}

/// Registers the generated site table with the runtime. May only succeed
/// once per process; generated startup code calls this before the first log
/// statement runs.
#[allow(unsafe_code)]
pub fn install(sites: &'static [LogSite]) -> Result<(), InstallError> {
    match STATE.compare_exchange(
        UNINSTALLED,
        INSTALLING,
        Ordering::Acquire,
        Ordering::Relaxed,
    ) {
        Ok(_) => {
            unsafe {
                SITES = sites;
            }
            STATE.store(INSTALLED, Ordering::Release);
            Ok(())
        }
        Err(_) => Err(InstallError(())),
    }
}

/// The installed table, or an empty one before `install` completes.
#[allow(unsafe_code)]
pub fn installed() -> &'static [LogSite] {
    if STATE.load(Ordering::Acquire) != INSTALLED {
        return &[];
    }
    unsafe { SITES }
}

/// Number of statically known call sites.
pub fn num_log_ids() -> usize {
    installed().len()
}

/// Appends `int` to `out` as a variable-length integer. Values below 241
/// take a single byte; the width grows with magnitude up to nine bytes.
pub fn pack_u64(out: &mut Vec<u8>, int: u64) {
    if int <= 240 {
        out.push(int as u8);
    } else if int <= 2287 {
        out.push(((int - 240) / 256 + 241) as u8);
        out.push(((int - 240) % 256) as u8);
    } else if int <= 67823 {
        out.push(249);
        out.push(((int - 2288) / 256) as u8);
        out.push(((int - 2288) % 256) as u8);
    } else {
        // 250..=255 tag 3..=8 little-endian payload bytes
        let bytes = int.to_le_bytes();
        let used = 8 - (int.leading_zeros() / 8) as usize;
        let width = used.max(3);
        out.push((247 + width) as u8);
        out.extend_from_slice(&bytes[..width]);
    }
}

/// Reads a `pack_u64` integer from the front of `buf`, advancing it.
/// Returns `None` on truncated input.
pub fn unpack_u64(buf: &mut &[u8]) -> Option<u64> {
    let (&first, rest) = buf.split_first()?;
    match first {
        0..=240 => {
            *buf = rest;
            Some(u64::from(first))
        }
        241..=248 => {
            let (&second, rest) = rest.split_first()?;
            *buf = rest;
            Some(240 + 256 * (u64::from(first) - 241) + u64::from(second))
        }
        249 => {
            if rest.len() < 2 {
                return None;
            }
            let int = 2288 + 256 * u64::from(rest[0]) + u64::from(rest[1]);
            *buf = &rest[2..];
            Some(int)
        }
        other => {
            let width = other as usize - 247;
            if rest.len() < width {
                return None;
            }
            let mut aligned = [0; 8];
            aligned[..width].copy_from_slice(&rest[..width]);
            *buf = &rest[width..];
            Some(u64::from_le_bytes(aligned))
        }
    }
}

/// A small hand-written stand-in for preprocessor output, used by the
/// bundled decoder binary and the test suite. Real applications link the
/// table their own build step generates.
pub mod demo {
    use super::*;

    /// Stages "Starting backup of {} bytes".
    pub fn log_backup_started(nbytes: u64) {
        crate::stage_record(0, &nbytes.to_le_bytes());
    }

    /// Stages "Backup complete, wrote {} objects in {} ms".
    pub fn log_backup_complete(objects: u64, millis: u64) {
        let mut args = [0; 16];
        args[..8].copy_from_slice(&objects.to_le_bytes());
        args[8..].copy_from_slice(&millis.to_le_bytes());
        crate::stage_record(1, &args);
    }

    /// Stages "Heartbeat".
    pub fn log_heartbeat() {
        crate::stage_record(2, &[]);
    }

    /// Stages "Write failed on {}: error {}".
    pub fn log_write_failed(path: &str, code: u64) {
        let mut args = Vec::with_capacity(4 + path.len() + 8);
        args.extend_from_slice(&(path.len() as u32).to_le_bytes());
        args.extend_from_slice(path.as_bytes());
        args.extend_from_slice(&code.to_le_bytes());
        crate::stage_record(3, &args);
    }

    fn args_u64(args: &[u8]) -> u64 {
        let mut b = [0; 8];
        b.copy_from_slice(&args[..8]);
        u64::from_le_bytes(b)
    }

    fn truncated() -> io::Error {
        io::Error::new(io::ErrorKind::UnexpectedEof, "truncated log record")
    }

    fn preamble(
        ts: u64,
        metadata: &LogMetadata,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        write!(
            out,
            "{} | {}:{} | {}: ",
            ts, metadata.file_name, metadata.line_number, metadata.severity
        )
    }

    fn compress_backup_started(ts: u64, args: &[u8], out: &mut Vec<u8>) {
        pack_u64(out, ts);
        pack_u64(out, args_u64(args));
    }

    fn decompress_backup_started(
        input: &mut &[u8],
        metadata: &LogMetadata,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let ts = unpack_u64(input).ok_or_else(truncated)?;
        let nbytes = unpack_u64(input).ok_or_else(truncated)?;
        preamble(ts, metadata, out)?;
        writeln!(out, "Starting backup of {} bytes", nbytes)
    }

    fn compress_backup_complete(ts: u64, args: &[u8], out: &mut Vec<u8>) {
        pack_u64(out, ts);
        pack_u64(out, args_u64(&args[..8]));
        pack_u64(out, args_u64(&args[8..]));
    }

    fn decompress_backup_complete(
        input: &mut &[u8],
        metadata: &LogMetadata,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let ts = unpack_u64(input).ok_or_else(truncated)?;
        let objects = unpack_u64(input).ok_or_else(truncated)?;
        let millis = unpack_u64(input).ok_or_else(truncated)?;
        preamble(ts, metadata, out)?;
        writeln!(out, "Backup complete, wrote {} objects in {} ms", objects, millis)
    }

    fn compress_heartbeat(ts: u64, _args: &[u8], out: &mut Vec<u8>) {
        pack_u64(out, ts);
    }

    fn decompress_heartbeat(
        input: &mut &[u8],
        metadata: &LogMetadata,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let ts = unpack_u64(input).ok_or_else(truncated)?;
        preamble(ts, metadata, out)?;
        writeln!(out, "Heartbeat")
    }

    fn compress_write_failed(ts: u64, args: &[u8], out: &mut Vec<u8>) {
        pack_u64(out, ts);
        let len = {
            let mut b = [0; 4];
            b.copy_from_slice(&args[..4]);
            u32::from_le_bytes(b) as usize
        };
        pack_u64(out, len as u64);
        out.extend_from_slice(&args[4..4 + len]);
        pack_u64(out, args_u64(&args[4 + len..]));
    }

    fn decompress_write_failed(
        input: &mut &[u8],
        metadata: &LogMetadata,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let ts = unpack_u64(input).ok_or_else(truncated)?;
        let len = unpack_u64(input).ok_or_else(truncated)? as usize;
        if input.len() < len {
            return Err(truncated());
        }
        let path = String::from_utf8_lossy(&input[..len]).into_owned();
        *input = &input[len..];
        let code = unpack_u64(input).ok_or_else(truncated)?;
        preamble(ts, metadata, out)?;
        writeln!(out, "Write failed on {}: error {}", path, code)
    }

    /// The demo site table.
    pub static SITES: &[LogSite] = &[
        LogSite {
            metadata: LogMetadata {
                file_name: "backup.rs",
                line_number: 37,
                severity: Severity::Notice,
                fmt_string: "Starting backup of {} bytes",
            },
            compress: compress_backup_started,
            decompress: decompress_backup_started,
        },
        LogSite {
            metadata: LogMetadata {
                file_name: "backup.rs",
                line_number: 81,
                severity: Severity::Notice,
                fmt_string: "Backup complete, wrote {} objects in {} ms",
            },
            compress: compress_backup_complete,
            decompress: decompress_backup_complete,
        },
        LogSite {
            metadata: LogMetadata {
                file_name: "supervisor.rs",
                line_number: 112,
                severity: Severity::Debug,
                fmt_string: "Heartbeat",
            },
            compress: compress_heartbeat,
            decompress: decompress_heartbeat,
        },
        LogSite {
            metadata: LogMetadata {
                file_name: "backup.rs",
                line_number: 95,
                severity: Severity::Error,
                fmt_string: "Write failed on {}: error {}",
            },
            compress: compress_write_failed,
            decompress: decompress_write_failed,
        },
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = EntryHeader { log_id: 3, size: 40, timestamp: u64::MAX - 5 };
        let mut buf = [0; STAGED_HEADER_BYTES];
        header.encode(&mut buf);
        assert_eq!(EntryHeader::decode(&buf), header);
    }

    #[test]
    fn varint_boundaries() {
        let cases = [
            0,
            1,
            240,
            241,
            2287,
            2288,
            67823,
            67824,
            0x00ff_ffff,
            0x0100_0000,
            0xffff_ffff,
            0x1_0000_0000,
            u64::MAX,
        ];
        for &int in &cases {
            let mut out = vec![];
            pack_u64(&mut out, int);
            let mut cursor = &out[..];
            assert_eq!(unpack_u64(&mut cursor), Some(int), "value {}", int);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn varint_truncation_detected() {
        let mut out = vec![];
        pack_u64(&mut out, u64::MAX);
        for cut in 0..out.len() {
            let mut cursor = &out[..cut];
            assert_eq!(unpack_u64(&mut cursor), None);
        }
    }

    #[test]
    fn install_is_once() {
        assert!(install(demo::SITES).is_ok());
        assert!(install(demo::SITES).is_err());
        assert_eq!(num_log_ids(), demo::SITES.len());
    }
}
