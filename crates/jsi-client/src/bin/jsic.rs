//! Minimal low-latency daemon client
//!
//! No validation, no canonicalization, no timing: argv[1] is written to
//! the socket as-is and the response is relayed. This is the variant to
//! benchmark the daemon round-trip with.

use std::env;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;

fn run() -> io::Result<String> {
    let home = env::var_os("HOME")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME is not set"))?;
    let socket = PathBuf::from(home).join(".jsi/daemon/server.sock");

    let input = env::args()
        .nth(1)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "usage: jsic <path>"))?;

    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(input.as_bytes())?;
    stream.shutdown(Shutdown::Write)?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

fn main() -> ExitCode {
    match run() {
        Ok(response) => {
            print!("{response}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(2)
        }
    }
}
