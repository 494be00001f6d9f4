//! Client for the jsi daemon
//!
//! Connects to the daemon socket, streams the input path, half-closes,
//! and relays the response to stdout. Timing goes to stderr. Kept free
//! of any async runtime: a warm daemon answers in single-digit
//! milliseconds and client startup cost would dominate it.

use std::env;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

fn socket_path() -> Option<PathBuf> {
    env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".jsi")
            .join("daemon")
            .join("server.sock")
    })
}

fn request(input: &str) -> std::io::Result<String> {
    let socket = socket_path().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "HOME is not set")
    })?;

    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(input.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.shutdown(Shutdown::Write)?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let input = match (args.next(), args.next()) {
        (Some(input), None) => input,
        _ => {
            eprintln!("usage: jsi-client <input-file>");
            return ExitCode::from(2);
        }
    };

    // the daemon only accepts absolute paths
    let input = match std::fs::canonicalize(&input) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(err) => {
            eprintln!("error: {input}: {err}");
            return ExitCode::from(2);
        }
    };

    let started = Instant::now();
    match request(&input) {
        Ok(response) => {
            print!("{response}");
            eprintln!("; response time: {:?}", started.elapsed());
            if response.starts_with("error") {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("error: cannot reach daemon: {err}");
            eprintln!("hint: start it with `jsi --daemon`");
            ExitCode::from(2)
        }
    }
}
