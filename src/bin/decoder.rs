//! Renders a compressed log file into human-readable lines.
//!
//! Must be built against the same generated site table that produced the
//! log; this build uses the crate's bundled demo table.

use docopt::Docopt;
use serde_derive::Deserialize;

use nanolog::generated::demo;
use nanolog::Decoder;

const USAGE: &str = "
Decompresses compressed log files into a human readable format.

Usage:
    decoder <logfile> [<messages>]
    decoder --find=<substring>

Options:
    --find=<substring>   Print the metadata of every call site whose format
                         string contains the substring, instead of decoding.
";

#[derive(Deserialize)]
struct Args {
    arg_logfile: Option<String>,
    arg_messages: Option<String>,
    flag_find: Option<String>,
}

fn main() {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(std::env::args()).deserialize())
        .unwrap_or_else(|e| e.exit());

    if let Some(substring) = args.flag_find {
        nanolog::decoder::print_metadata_containing(demo::SITES, &substring);
        return;
    }

    let logfile = args.arg_logfile.expect("docopt guarantees the operand");

    let max_messages = match args.arg_messages {
        None => None,
        Some(raw) => match raw.parse::<i64>() {
            Err(_) => {
                println!("Invalid number of messages to print: {}", raw);
                std::process::exit(-1);
            }
            Ok(n) if n < 0 => {
                println!("Number of messages to print must be non-negative: {}", raw);
                std::process::exit(-1);
            }
            Ok(0) => None,
            Ok(n) => Some(n as u64),
        },
    };

    let mut decoder = match Decoder::open(&logfile, demo::SITES) {
        Ok(decoder) => decoder,
        Err(_) => {
            println!("Unable to open file {}", logfile);
            std::process::exit(-1);
        }
    };

    let stdout = std::io::stdout();
    let mut sink = stdout.lock();
    if let Err(e) = decoder.decompress_unordered(&mut sink, max_messages) {
        eprintln!("failed to decode {}: {}", logfile, e);
        std::process::exit(-1);
    }
}
