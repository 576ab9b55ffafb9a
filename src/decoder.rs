//! Offline reconstruction of human-readable log lines.
//!
//! The compressed log is a stream of records, each prefixed with a
//! little-endian `u32` holding the call site id plus one; a zero prefix is
//! alignment padding left by the writer and is skipped to the next
//! alignment boundary. The payload behind each prefix belongs entirely to
//! that call site's generated decompressor, which re-renders it against the
//! static metadata table.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::config::FILE_ALIGNMENT_BYTES;
use crate::generated::LogSite;

/// Reads a compressed log file and renders records through a generated
/// site table.
pub struct Decoder {
    buf: Vec<u8>,
    pos: usize,
    sites: &'static [LogSite],
}

impl Decoder {
    /// Opens `path` for decoding with the site table the log was produced
    /// against.
    pub fn open<P: AsRef<Path>>(path: P, sites: &'static [LogSite]) -> io::Result<Decoder> {
        let buf = fs::read(path)?;
        Ok(Decoder { buf, pos: 0, sites })
    }

    /// Renders records into `sink` in file order. File order interleaves
    /// producer threads arbitrarily; no global time order is promised.
    /// Stops after `max_messages` records when given, otherwise at end of
    /// file. Returns the number of log bytes consumed.
    pub fn decompress_unordered(
        &mut self,
        sink: &mut dyn Write,
        max_messages: Option<u64>,
    ) -> io::Result<u64> {
        let mut rendered = 0u64;

        loop {
            if let Some(max) = max_messages {
                if rendered >= max {
                    break;
                }
            }
            if self.pos + 4 > self.buf.len() {
                // nothing but trailing padding can be shorter than a prefix
                break;
            }

            let mut prefix = [0; 4];
            prefix.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
            let tag = u32::from_le_bytes(prefix);

            if tag == 0 {
                // padding runs to the next alignment boundary
                let next = round_up(self.pos + 1, FILE_ALIGNMENT_BYTES);
                self.pos = next.min(self.buf.len());
                continue;
            }

            let id = (tag - 1) as usize;
            if id >= self.sites.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("log id {} is not in the metadata table", id),
                ));
            }

            let site = &self.sites[id];
            let mut cursor = &self.buf[self.pos + 4..];
            let before = cursor.len();
            (site.decompress)(&mut cursor, &site.metadata, sink)?;
            self.pos += 4 + (before - cursor.len());
            rendered += 1;
        }

        Ok(self.pos as u64)
    }
}

/// Prints the metadata of every call site whose format string contains
/// `substring`, as an `id | filename | line | format string` table.
pub fn print_metadata_containing(sites: &[LogSite], substring: &str) {
    let matching: Vec<usize> = sites
        .iter()
        .enumerate()
        .filter(|(_, site)| site.metadata.fmt_string.contains(substring))
        .map(|(id, _)| id)
        .collect();

    println!("{:>4} | {:<20} | {:<4} | {}", "id", "filename", "line", "format string");
    for id in matching {
        let m = &sites[id].metadata;
        println!(
            "{:>4} | {:<20} | {:<4} | {}",
            id, m.file_name, m.line_number, m.fmt_string
        );
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}
