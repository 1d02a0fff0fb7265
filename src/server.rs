/// Server state: listening socket, client queue, worker registry, and the
/// ordered shutdown that tears them down.
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::fatal;
use crate::queue::ClientQueue;
use crate::registry::{JoinReport, WorkerId, WorkerRegistry};
use crate::shutdown::ShutdownToken;
use crate::signals::{self, Readiness, SignalState};
use crate::stats::{ServerStats, StatsSnapshot};
use crate::worker::{self, WorkerContext};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

/// Errors that stop the server from starting or accepting.
#[derive(Debug)]
pub enum ServerError {
    /// Failed to create, bind or listen on the server socket.
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// Failed to start a worker thread.
    Spawn { source: std::io::Error },
    /// Waiting on the listening socket failed.
    Poll { source: nix::Error },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "failed to listen on {}: {}", addr, source)
            }
            ServerError::Spawn { source } => {
                write!(f, "failed to spawn worker thread: {}", source)
            }
            ServerError::Poll { source } => {
                write!(f, "failed to wait for connections: {}", source)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Spawn { source } => Some(source),
            ServerError::Poll { source } => Some(source),
        }
    }
}

/// What the shutdown sequence did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub workers: JoinReport,
    /// Connections still queued when the workers were gone.
    pub discarded: usize,
    pub stats: StatsSnapshot,
}

pub struct Server {
    listener: TcpListener,
    ctx: WorkerContext,
    shutdown: ShutdownToken,
    signals: Option<SignalState>,
    poll_interval: Duration,
    next_connection: u64,
    /// Workers joined by earlier reaps, before the final join pass.
    reaped: JoinReport,
}

impl Server {
    /// Bind the listener, install signal handling, and start the idle pool.
    ///
    /// Signals are blocked before the first worker exists so every worker
    /// inherits the block.
    pub fn initialize(config: &ServerConfig) -> Result<Self, ServerError> {
        let listener = bind_listener(config)?;
        let signals = SignalState::install();
        let mut server = Self::with_listener(listener, config, Some(signals));
        for _ in 0..config.workers.pool_size {
            if let Err(e) = server.spawn_worker() {
                return Err(server.abandon(e));
            }
        }
        Ok(server)
    }

    /// Tear down a server that failed to start, returning the cause.
    fn abandon(self, err: ServerError) -> ServerError {
        tracing::error!(error = %err, "[SERVER] startup failed");
        self.shutdown_and_join();
        err
    }

    fn with_listener(
        listener: TcpListener,
        config: &ServerConfig,
        signals: Option<SignalState>,
    ) -> Self {
        let shutdown = ShutdownToken::new();
        let ctx = WorkerContext::new(
            Arc::new(ClientQueue::new(shutdown.clone())),
            Arc::new(WorkerRegistry::new(shutdown.clone())),
            Arc::new(ServerStats::default()),
            &config.output,
        );
        Self {
            listener,
            ctx,
            shutdown,
            signals,
            poll_interval: config.listen.poll_interval(),
            next_connection: 0,
            reaped: JoinReport::default(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop when triggered.
    #[cfg(test)]
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Start one more worker on the shared queue.
    ///
    /// Also joins workers that already finished.
    pub fn spawn_worker(&mut self) -> Result<WorkerId, ServerError> {
        let reaped = self.ctx.registry.reap_retired();
        if reaped.joined > 0 {
            tracing::debug!(count = reaped.joined, "reaped finished workers");
            self.reaped.joined += reaped.joined;
            self.reaped.panicked += reaped.panicked;
        }
        worker::spawn(&self.ctx).map_err(|e| ServerError::Spawn { source: e })
    }

    /// Hand an accepted connection to the workers.
    ///
    /// After shutdown the connection is closed instead.
    pub fn enqueue(&self, conn: Connection) {
        match self.ctx.queue.push(conn) {
            Ok(()) => self.ctx.stats.record_accepted(),
            Err(rejected) => {
                tracing::warn!(conn = rejected.id(), "queue closed, dropping connection");
                self.ctx.stats.record_rejected();
                rejected.close();
            }
        }
    }

    /// Whether the accept loop should stop, turning a delivered SIGINT into a
    /// shutdown request the first time it is seen.
    fn should_stop(&self) -> bool {
        if self.signals.is_some() && signals::interrupted() && self.shutdown.trigger() {
            tracing::info!("[SERVER] interrupt received, shutting down");
        }
        self.shutdown.is_triggered()
    }

    /// Accept connections until shutdown is requested.
    ///
    /// Every accepted connection is queued and matched by one new worker, so
    /// the number of idle workers stays at the configured pool size.
    pub fn run(&mut self) -> Result<(), ServerError> {
        tracing::info!(addr = ?self.local_addr().ok(), "[SERVER] accepting connections");
        let wait_mask = self.signals.as_ref().map(SignalState::wait_mask);
        while !self.should_stop() {
            match signals::wait_readable(&self.listener, self.poll_interval, wait_mask) {
                Ok(Readiness::Ready) => {
                    if self.accept_pending()? == AcceptStep::Backoff {
                        signals::pause(self.poll_interval, wait_mask)
                            .map_err(|e| ServerError::Poll { source: e })?;
                    }
                }
                Ok(Readiness::Idle) => {}
                Err(e) => return Err(ServerError::Poll { source: e }),
            }
        }
        Ok(())
    }

    /// Accept until the backlog is empty. Returns [`AcceptStep::Backoff`] when
    /// `accept` failed in a way that readiness alone will not clear.
    fn accept_pending(&mut self) -> Result<AcceptStep, ServerError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::warn!(peer = %peer, error = %e, "cannot make client socket blocking");
                        fatal::close_or_abort(stream, "client socket");
                        continue;
                    }
                    let conn = Connection::new(self.next_connection, stream, Some(peer));
                    self.next_connection += 1;
                    tracing::debug!(conn = conn.id(), peer = %conn.peer_display(), "accepted");
                    self.enqueue(conn);
                    self.spawn_worker()?;
                }
                Err(e) => match accept_step(&e) {
                    AcceptStep::Retry => continue,
                    AcceptStep::Drained => return Ok(AcceptStep::Drained),
                    AcceptStep::Backoff => {
                        tracing::warn!(error = %e, "accept failed, backing off");
                        return Ok(AcceptStep::Backoff);
                    }
                },
            }
        }
    }

    /// Run the shutdown sequence and consume the server.
    ///
    /// Order: stop accepting, close the listening socket, join every worker,
    /// drop the registry, empty and drop the queue, restore signal state.
    pub fn shutdown_and_join(self) -> ShutdownReport {
        let Self {
            listener,
            ctx,
            shutdown,
            signals,
            reaped,
            ..
        } = self;

        tracing::info!("[SERVER] stopping acceptor");
        shutdown.trigger();
        ctx.queue.close();

        tracing::info!("[SERVER] closing server socket");
        fatal::close_or_abort(listener, "listening socket");

        tracing::info!(
            registered = ctx.registry.len(),
            "[SERVER] joining worker threads"
        );
        let joined = ctx.registry.join_all();
        let workers = JoinReport {
            joined: reaped.joined + joined.joined,
            panicked: reaped.panicked + joined.panicked,
        };

        tracing::info!(queued = ctx.queue.len(), "[SERVER] removing client queue");
        let discarded = ctx.queue.clear();
        let stats = ctx.stats.snapshot();
        drop(ctx);

        if let Some(signals) = signals {
            tracing::info!("[SERVER] restoring signal mask");
            signals.restore();
        }

        tracing::info!(
            joined = workers.joined,
            panicked = workers.panicked,
            discarded,
            accepted = stats.accepted,
            rejected = stats.rejected,
            served = stats.served,
            failed = stats.failed,
            bytes = stats.bytes,
            "[SERVER] shutdown complete"
        );
        ShutdownReport {
            workers,
            discarded,
            stats,
        }
    }
}

/// How the accept loop continues after `accept` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptStep {
    /// Nothing left in the backlog.
    Drained,
    /// Transient; try the next connection right away.
    Retry,
    /// Out of descriptors or similar; the listener stays readable, so wait
    /// one poll interval before trying again.
    Backoff,
}

fn accept_step(err: &io::Error) -> AcceptStep {
    match err.kind() {
        ErrorKind::WouldBlock => AcceptStep::Drained,
        ErrorKind::Interrupted | ErrorKind::ConnectionAborted => AcceptStep::Retry,
        _ => AcceptStep::Backoff,
    }
}

/// Create the listening socket: SO_REUSEADDR, configured backlog, non-blocking
/// so a connection that vanishes between readiness and accept cannot stall us.
fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::new(config.listen.bind, config.listen.port);
    let err = |source| ServerError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(err)?;
    socket.set_reuse_address(true).map_err(err)?;
    socket.bind(&addr.into()).map_err(err)?;
    socket.listen(config.listen.backlog).map_err(err)?;
    socket.set_nonblocking(true).map_err(err)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{IpAddr, TcpStream};
    use std::thread;

    /// A server on an ephemeral loopback port, without process signal handling.
    fn test_server(dir: &std::path::Path, pool_size: usize) -> Server {
        let mut config = ServerConfig::default();
        config.listen.bind = IpAddr::from([127, 0, 0, 1]);
        config.listen.poll_interval_ms = 20;
        config.workers.pool_size = pool_size;
        config.output.dir = dir.to_path_buf();
        let listener = bind_listener(&config).unwrap();
        let mut server = Server::with_listener(listener, &config, None);
        for _ in 0..pool_size {
            server.spawn_worker().unwrap();
        }
        server
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    fn out_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|x| x == "out"))
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_bind_error_reports_address() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = ServerConfig::default();
        config.listen.bind = IpAddr::from([127, 0, 0, 1]);
        config.listen.port = taken.local_addr().unwrap().port();
        // SO_REUSEADDR does not allow two listeners on the same port.
        let err = bind_listener(&config).unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.to_string().contains("failed to listen on 127.0.0.1:"));
    }

    #[test]
    fn test_three_connections_two_idle_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path(), 2);
        let addr = server.local_addr().unwrap();
        let token = server.shutdown_token();

        let acceptor = thread::spawn(move || {
            server.run().unwrap();
            server
        });

        for i in 0..3 {
            let mut client = TcpStream::connect(addr).unwrap();
            write!(client, "client {i}").unwrap();
        }
        wait_for(|| out_files(dir.path()).len() == 3);
        let written = |i: usize| {
            out_files(dir.path())
                .iter()
                .any(|p| std::fs::read_to_string(p).unwrap() == format!("client {i}"))
        };
        wait_for(|| (0..3).all(&written));

        token.trigger();
        let server = acceptor.join().unwrap();
        let report = server.shutdown_and_join();

        assert_eq!(report.stats.accepted, 3);
        assert_eq!(report.stats.served, 3);
        assert_eq!(report.stats.failed, 0);
        assert_eq!(report.discarded, 0);
        // Two initial workers plus one replacement per accepted connection.
        assert_eq!(report.workers.joined, 5);
        assert_eq!(report.workers.panicked, 0);
    }

    #[test]
    fn test_shutdown_reaps_idle_worker_without_connection() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path(), 1);
        wait_for(|| server.ctx.registry.len() == 1);

        let report = server.shutdown_and_join();
        assert_eq!(report.workers.joined, 1);
        assert_eq!(report.stats, StatsSnapshot::default());
        assert!(out_files(dir.path()).is_empty());
    }

    #[test]
    fn test_zero_byte_client_leaves_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path(), 1);
        let addr = server.local_addr().unwrap();
        let token = server.shutdown_token();
        let acceptor = thread::spawn(move || {
            server.run().unwrap();
            server
        });

        let client = TcpStream::connect(addr).unwrap();
        let local = client.local_addr().unwrap();
        drop(client);

        let expected = dir
            .path()
            .join(format!("{}_{}.out", local.ip(), local.port()));
        let server_stats = {
            wait_for(|| expected.exists());
            token.trigger();
            acceptor.join().unwrap().shutdown_and_join()
        };
        assert_eq!(std::fs::metadata(&expected).unwrap().len(), 0);
        assert_eq!(server_stats.stats.served, 1);
    }

    #[test]
    fn test_unwritable_output_dir_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(&dir.path().join("does-not-exist"), 1);
        let addr = server.local_addr().unwrap();
        let token = server.shutdown_token();
        let acceptor = thread::spawn(move || {
            server.run().unwrap();
            server
        });

        let mut client = TcpStream::connect(addr).unwrap();
        // The worker closes without reading; the client sees end-of-stream.
        let mut buf = [0u8; 8];
        let n = std::io::Read::read(&mut client, &mut buf).unwrap();
        assert_eq!(n, 0);

        token.trigger();
        let report = acceptor.join().unwrap().shutdown_and_join();
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.served, 0);
    }

    #[test]
    fn test_enqueue_after_shutdown_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path(), 1);
        let addr = server.local_addr().unwrap();
        server.shutdown_token().trigger();
        server.ctx.queue.close();

        let mut client = TcpStream::connect(addr).unwrap();
        let (stream, peer) = loop {
            match server.listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept: {e}"),
            }
        };
        stream.set_nonblocking(false).unwrap();
        server.enqueue(Connection::new(0, stream, Some(peer)));

        let mut buf = [0u8; 8];
        assert_eq!(std::io::Read::read(&mut client, &mut buf).unwrap(), 0);
        let report = server.shutdown_and_join();
        assert_eq!(report.discarded, 0);
        assert_eq!(report.stats.accepted, 0);
        assert_eq!(report.stats.rejected, 1);
    }

    #[test]
    fn test_accept_step_backs_off_on_descriptor_exhaustion() {
        let emfile = io::Error::from_raw_os_error(nix::errno::Errno::EMFILE as i32);
        assert_eq!(accept_step(&emfile), AcceptStep::Backoff);
        let enfile = io::Error::from_raw_os_error(nix::errno::Errno::ENFILE as i32);
        assert_eq!(accept_step(&enfile), AcceptStep::Backoff);
        let aborted = io::Error::from(ErrorKind::ConnectionAborted);
        assert_eq!(accept_step(&aborted), AcceptStep::Retry);
        let would_block = io::Error::from(ErrorKind::WouldBlock);
        assert_eq!(accept_step(&would_block), AcceptStep::Drained);
    }

    #[test]
    fn test_abandon_tears_down_started_workers() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path(), 2);
        let addr = server.local_addr().unwrap();
        let registry = Arc::clone(&server.ctx.registry);
        let queue = Arc::clone(&server.ctx.queue);
        wait_for(|| registry.len() == 2);

        let err = server.abandon(ServerError::Spawn {
            source: io::Error::from(ErrorKind::OutOfMemory),
        });
        assert!(matches!(err, ServerError::Spawn { .. }));
        assert!(registry.is_empty());
        assert!(TcpStream::connect(addr).is_err());

        let (client, server_side) = crate::connection::tests::loopback_pair();
        let rejected = queue.push(Connection::new(0, server_side, None)).unwrap_err();
        rejected.close();
        drop(client);
    }

    #[test]
    fn test_interrupt_stops_accept_loop() {
        use nix::sys::signal::{raise, SigSet, Signal};

        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.listen.bind = IpAddr::from([127, 0, 0, 1]);
        config.listen.port = 0;
        config.listen.poll_interval_ms = 5_000;
        config.workers.pool_size = 2;
        config.output.dir = dir.path().to_path_buf();

        let mut server = Server::initialize(&config).unwrap();
        // SIGINT is blocked here, so it stays pending until the accept wait
        // lets it through.
        raise(Signal::SIGINT).unwrap();
        let started = std::time::Instant::now();
        server.run().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        let report = server.shutdown_and_join();
        assert_eq!(report.workers.joined, 2);
        assert_eq!(report.workers.panicked, 0);
        assert!(!SigSet::thread_get_mask().unwrap().contains(Signal::SIGINT));
    }
}
