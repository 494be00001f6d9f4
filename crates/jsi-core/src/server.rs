//! Long-lived daemon serving solve requests over a Unix stream socket
//!
//! One accepted connection carries one request: the bytes of an
//! absolute input path, terminated by newline or client half-close.
//! The response is the same text a one-shot run prints on stdout
//! (verdict line, then `; (result from <solver>)`), after which the
//! server closes the connection. The catalogue is loaded once at
//! startup so a warm daemon answers trivial requests in milliseconds.

use crate::catalog::Catalog;
use crate::error::JsiError;
use crate::supervisor::{self, SolveOptions};
use crate::task::{CancelReason, Task};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Longest accepted request line (paths are short)
const MAX_REQUEST_LEN: usize = 4096;

/// How long the daemon waits for in-flight requests on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runtime file locations under `{home}/daemon/`
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub root: PathBuf,
    pub socket: PathBuf,
    pub pid_file: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl DaemonPaths {
    pub fn new(home: &Path) -> Self {
        let root = home.join("daemon");
        Self {
            socket: root.join("server.sock"),
            pid_file: root.join("server.pid"),
            stdout: root.join("server.out"),
            stderr: root.join("server.err"),
            root,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub home: PathBuf,
    /// Requests beyond this bound are answered with `error: busy`
    pub max_inflight: usize,
    /// Connections idle for this long before sending a request are dropped
    pub idle_timeout: Duration,
    pub solve_options: SolveOptions,
}

impl ServerConfig {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            max_inflight: 16,
            idle_timeout: Duration::from_secs(5),
            solve_options: SolveOptions::default(),
        }
    }
}

/// Check whether a live daemon already owns the socket.
///
/// The PID file alone is not trusted: the PID must be alive *and* the
/// socket must accept a connection.
pub fn probe(paths: &DaemonPaths) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(&paths.pid_file)
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if !pid_alive(pid) {
        return None;
    }
    std::os::unix::net::UnixStream::connect(&paths.socket).ok()?;
    Some(pid)
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Handle for asking a running server to stop accepting and drain
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send_replace(true);
    }
}

/// The daemon: catalogue plus accept loop
pub struct Server {
    config: ServerConfig,
    catalog: Catalog,
    paths: DaemonPaths,
    shutdown: Arc<watch::Sender<bool>>,
    inflight: Arc<Mutex<Vec<Arc<Task>>>>,
}

impl Server {
    /// Load the catalogue and prepare the daemon
    pub fn new(config: ServerConfig) -> Result<Self, JsiError> {
        let catalog = Catalog::load(&config.home)?;
        let paths = DaemonPaths::new(&config.home);
        Ok(Self {
            config,
            catalog,
            paths,
            shutdown: Arc::new(watch::Sender::new(false)),
            inflight: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Bind the socket and serve until SIGTERM (or the shutdown
    /// handle). Returns after the socket and PID file are unlinked.
    pub async fn run(self) -> Result<(), JsiError> {
        std::fs::create_dir_all(&self.paths.root)?;

        if let Some(pid) = probe(&self.paths) {
            return Err(JsiError::AlreadyRunning(pid));
        }
        // stale leftovers from an unclean exit
        let _ = std::fs::remove_file(&self.paths.socket);
        let _ = std::fs::remove_file(&self.paths.pid_file);

        let listener = UnixListener::bind(&self.paths.socket)?;
        std::fs::write(&self.paths.pid_file, std::process::id().to_string())?;
        info!(socket = %self.paths.socket.display(), "daemon listening");

        self.spawn_signal_handlers();

        let permits = Arc::new(Semaphore::new(self.config.max_inflight));
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.dispatch(stream, &permits),
                        Err(err) => {
                            // transient accept errors don't kill the daemon
                            warn!(%err, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutting down, draining in-flight requests");
        let tasks: Vec<Arc<Task>> = self.inflight.lock().await.clone();
        for task in &tasks {
            task.cancel(CancelReason::Shutdown);
        }
        let drained = timeout(SHUTDOWN_GRACE, async {
            for task in &tasks {
                task.wait_done().await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace elapsed with requests still in flight");
        }

        let _ = std::fs::remove_file(&self.paths.socket);
        let _ = std::fs::remove_file(&self.paths.pid_file);
        info!("daemon stopped");
        Ok(())
    }

    fn dispatch(&self, stream: UnixStream, permits: &Arc<Semaphore>) {
        match permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let catalog = self.catalog.clone();
                let options = self.config.solve_options.clone();
                let idle = self.config.idle_timeout;
                let inflight = self.inflight.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_client(stream, permit, catalog, options, idle, inflight).await
                    {
                        error!(%err, "connection failed");
                    }
                });
            }
            Err(_) => {
                debug!("at capacity, rejecting connection");
                tokio::spawn(async move {
                    let mut stream = stream;
                    let response = format!("error: {}\n", JsiError::Busy);
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        }
    }

    fn spawn_signal_handlers(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown = self.shutdown.clone();
        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = signal(SignalKind::interrupt()).ok();

            // first signal: stop accepting and drain
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = async {
                    match sigint.as_mut() {
                        Some(s) => { s.recv().await; }
                        None => std::future::pending().await,
                    }
                } => {}
            }
            info!("signal received, beginning graceful shutdown");
            let _ = shutdown.send_replace(true);

            // second signal: kill sweep and immediate exit
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = async {
                    match sigint.as_mut() {
                        Some(s) => { s.recv().await; }
                        None => std::future::pending().await,
                    }
                } => {}
            }
            warn!("second signal, escalating to immediate exit");
            for task in inflight.lock().await.iter() {
                task.escalate();
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::process::exit(1);
        });
    }
}

async fn handle_client(
    mut stream: UnixStream,
    _permit: OwnedSemaphorePermit,
    catalog: Catalog,
    options: SolveOptions,
    idle: Duration,
    inflight: Arc<Mutex<Vec<Arc<Task>>>>,
) -> Result<(), JsiError> {
    let request = match timeout(idle, read_request(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => {
            debug!("idle connection dropped");
            return Ok(());
        }
    };

    let response = match validate_request(&request) {
        Ok(input) => {
            info!(input = %input.display(), "request");
            let task = Arc::new(Task::new());
            inflight.lock().await.push(task.clone());

            let result = supervisor::solve(&input, &options, &catalog, task.clone()).await;
            // errors must not leave waiters hanging
            task.advance(crate::task::TaskStatus::Completed);
            inflight
                .lock()
                .await
                .retain(|t| !Arc::ptr_eq(t, &task));

            match result {
                Ok(outcome) => outcome.response_text(),
                Err(err) => format!("error: {err}\n"),
            }
        }
        Err(reason) => format!("error: {reason}\n"),
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read one request: path bytes up to newline or EOF
async fn read_request(stream: &mut UnixStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.contains(&b'\n') || buf.len() >= MAX_REQUEST_LEN {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    Ok(text.lines().next().unwrap_or("").trim().to_string())
}

fn validate_request(request: &str) -> Result<PathBuf, String> {
    if request.is_empty() {
        return Err("empty request".to_string());
    }
    let path = PathBuf::from(request);
    if !path.is_absolute() {
        return Err(format!("path is not absolute: {request}"));
    }
    if !path.is_file() {
        return Err(format!("no such file: {request}"));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn scratch_home(solvers_json: &str) -> TempDir {
        let home = TempDir::new().unwrap();
        std::fs::write(home.path().join("solvers.json"), solvers_json).unwrap();
        home
    }

    const VIRTUAL_SAT: &str = r#"{"solvers": [
        {"name": "always-sat", "executable": "always-sat", "args": [], "virtual": "always_sat"}
    ]}"#;

    fn request(socket: &Path, line: &str) -> String {
        let mut stream = std::os::unix::net::UnixStream::connect(socket).unwrap();
        stream.write_all(line.as_bytes()).unwrap();
        stream
            .shutdown(std::net::Shutdown::Write)
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    async fn start_server(config: ServerConfig) -> (ShutdownHandle, tokio::task::JoinHandle<()>, DaemonPaths) {
        let server = Server::new(config).unwrap();
        let paths = server.paths().clone();
        let handle = server.shutdown_handle();
        let join = tokio::spawn(async move {
            server.run().await.unwrap();
        });
        // wait for the socket to appear
        for _ in 0..100 {
            if paths.socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (handle, join, paths)
    }

    #[tokio::test]
    async fn daemon_happy_path() {
        let home = scratch_home(VIRTUAL_SAT);
        let input = home.path().join("easy-sat.smt2");
        std::fs::write(&input, "(check-sat)\n").unwrap();

        let (handle, join, paths) = start_server(ServerConfig::new(home.path().to_path_buf())).await;

        let line = format!("{}\n", input.display());
        let socket = paths.socket.clone();
        let response = tokio::task::spawn_blocking(move || request(&socket, &line))
            .await
            .unwrap();
        assert_eq!(response, "sat\n; (result from always-sat)\n");

        handle.shutdown();
        join.await.unwrap();
        assert!(!paths.socket.exists());
        assert!(!paths.pid_file.exists());
    }

    #[tokio::test]
    async fn repeat_requests_are_byte_identical() {
        let home = scratch_home(VIRTUAL_SAT);
        let input = home.path().join("q.smt2");
        std::fs::write(&input, "(check-sat)\n").unwrap();

        let (handle, join, paths) = start_server(ServerConfig::new(home.path().to_path_buf())).await;

        let line = format!("{}\n", input.display());
        let mut responses = Vec::new();
        for _ in 0..2 {
            let socket = paths.socket.clone();
            let line = line.clone();
            responses.push(
                tokio::task::spawn_blocking(move || request(&socket, &line))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(responses[0], responses[1]);

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn eof_terminated_request_works() {
        let home = scratch_home(VIRTUAL_SAT);
        let input = home.path().join("q.smt2");
        std::fs::write(&input, "(check-sat)\n").unwrap();

        let (handle, join, paths) = start_server(ServerConfig::new(home.path().to_path_buf())).await;

        // no trailing newline: the half-close terminates the request
        let line = input.display().to_string();
        let socket = paths.socket.clone();
        let response = tokio::task::spawn_blocking(move || request(&socket, &line))
            .await
            .unwrap();
        assert!(response.starts_with("sat\n"));

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn bad_requests_get_error_responses() {
        let home = scratch_home(VIRTUAL_SAT);
        let (handle, join, paths) = start_server(ServerConfig::new(home.path().to_path_buf())).await;

        for (line, needle) in [
            ("relative/path.smt2\n", "not absolute"),
            ("/definitely/not/there.smt2\n", "no such file"),
        ] {
            let socket = paths.socket.clone();
            let line = line.to_string();
            let response = tokio::task::spawn_blocking(move || request(&socket, &line))
                .await
                .unwrap();
            assert!(response.starts_with("error: "), "got: {response}");
            assert!(response.contains(needle), "got: {response}");
        }

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn busy_daemon_rejects_excess_connections() {
        let home = scratch_home(VIRTUAL_SAT);
        let mut config = ServerConfig::new(home.path().to_path_buf());
        config.max_inflight = 0;

        let (handle, join, paths) = start_server(config).await;

        let socket = paths.socket.clone();
        let response = tokio::task::spawn_blocking(move || request(&socket, "/tmp/x.smt2\n"))
            .await
            .unwrap();
        assert_eq!(response, "error: busy\n");

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn stale_pid_and_socket_are_replaced() {
        let home = scratch_home(VIRTUAL_SAT);
        let paths = DaemonPaths::new(home.path());
        std::fs::create_dir_all(&paths.root).unwrap();
        // a PID that cannot be alive and a dead socket file
        std::fs::write(&paths.pid_file, "999999999").unwrap();
        std::fs::write(&paths.socket, "").unwrap();

        assert!(probe(&paths).is_none());

        let (handle, join, paths) = start_server(ServerConfig::new(home.path().to_path_buf())).await;
        let pid = std::fs::read_to_string(&paths.pid_file).unwrap();
        assert_eq!(pid, std::process::id().to_string());

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn second_instance_is_refused() {
        let home = scratch_home(VIRTUAL_SAT);
        let (handle, join, _paths) = start_server(ServerConfig::new(home.path().to_path_buf())).await;

        let second = Server::new(ServerConfig::new(home.path().to_path_buf())).unwrap();
        let err = second.run().await.unwrap_err();
        assert!(matches!(err, JsiError::AlreadyRunning(_)));

        handle.shutdown();
        join.await.unwrap();
    }

    #[test]
    fn probe_without_files_is_none() {
        let home = TempDir::new().unwrap();
        let paths = DaemonPaths::new(home.path());
        assert!(probe(&paths).is_none());
    }

    #[test]
    fn validate_rejects_relative_and_missing() {
        assert!(validate_request("").is_err());
        assert!(validate_request("relative.smt2").is_err());
        assert!(validate_request("/no/such/file/anywhere.smt2").is_err());
    }
}
