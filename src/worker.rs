/// Worker thread lifecycle: take one connection from the queue, spool its
/// bytes into the client's file, close everything, retire.
///
/// Read, write and open failures end only the current connection. Failing to
/// close our own socket or file aborts the process.
use crate::config::OutputConfig;
use crate::connection::Connection;
use crate::fatal;
use crate::queue::ClientQueue;
use crate::registry::{WorkerId, WorkerRegistry};
use crate::signals::ThreadSignalBlock;
use crate::stats::ServerStats;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a worker needs, shared with the acceptor.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub queue: Arc<ClientQueue>,
    pub registry: Arc<WorkerRegistry>,
    pub stats: Arc<ServerStats>,
    pub output_dir: PathBuf,
    pub buffer_size: usize,
    pub file_mode: u32,
}

impl WorkerContext {
    pub fn new(
        queue: Arc<ClientQueue>,
        registry: Arc<WorkerRegistry>,
        stats: Arc<ServerStats>,
        output: &OutputConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            stats,
            output_dir: output.dir.clone(),
            buffer_size: output.buffer_size,
            file_mode: output.file_mode,
        }
    }
}

/// How a worker's single connection ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// Shutdown with an empty queue; never got a connection.
    NoWork,
    /// Client reached end-of-stream.
    Served { bytes: u64 },
    /// The output file could not be opened; nothing was read.
    OpenFailed,
    /// The transfer stopped early.
    Abandoned(TransferError),
}

impl WorkerOutcome {
    /// Add this outcome to the server counters.
    pub fn record(&self, stats: &ServerStats) {
        match self {
            WorkerOutcome::NoWork => {}
            WorkerOutcome::Served { bytes } => stats.record_served(*bytes),
            WorkerOutcome::OpenFailed => stats.record_failed(0),
            WorkerOutcome::Abandoned(e) => stats.record_failed(e.bytes()),
        }
    }
}

/// Per-connection transfer failure.
#[derive(Debug)]
pub enum TransferError {
    Read {
        bytes: u64,
        source: std::io::Error,
    },
    Write {
        bytes: u64,
        source: std::io::Error,
    },
}

impl TransferError {
    /// Bytes written to the file before the failure.
    pub fn bytes(&self) -> u64 {
        match self {
            TransferError::Read { bytes, .. } | TransferError::Write { bytes, .. } => *bytes,
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Read { bytes, source } => {
                write!(f, "read error after {} bytes: {}", bytes, source)
            }
            TransferError::Write { bytes, source } => {
                write!(f, "write error after {} bytes: {}", bytes, source)
            }
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Read { source, .. } => Some(source),
            TransferError::Write { source, .. } => Some(source),
        }
    }
}

/// Spawn one worker bound to the shared queue and registry.
pub fn spawn(ctx: &WorkerContext) -> std::io::Result<WorkerId> {
    let ctx = ctx.clone();
    let registry = Arc::clone(&ctx.registry);
    registry.spawn(move |id| {
        run(id, &ctx);
    })
}

/// Body of a worker thread.
pub fn run(id: WorkerId, ctx: &WorkerContext) -> WorkerOutcome {
    let block = ThreadSignalBlock::block();
    tracing::info!(worker = %id, "started");

    let outcome = match ctx.queue.pop() {
        Some(conn) => serve(id, conn, ctx),
        None => {
            tracing::info!(worker = %id, "no work, shutting down");
            WorkerOutcome::NoWork
        }
    };

    outcome.record(&ctx.stats);
    ctx.registry.unregister_if_running(id);
    drop(block);
    tracing::info!(worker = %id, "terminated");
    outcome
}

fn serve(id: WorkerId, mut conn: Connection, ctx: &WorkerContext) -> WorkerOutcome {
    let path = conn.output_path(&ctx.output_dir);
    tracing::info!(
        worker = %id,
        conn = conn.id(),
        peer = %conn.peer_display(),
        file = %path.display(),
        "client connected"
    );

    let mut file = match open_output(&path, ctx.file_mode) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(
                worker = %id,
                file = %path.display(),
                error = %e,
                "cannot open output file"
            );
            None
        }
    };

    let outcome = match file.as_mut() {
        Some(file) => match spool(conn.stream_mut(), file, ctx.buffer_size) {
            Ok(bytes) => {
                tracing::info!(worker = %id, bytes, "client finished sending");
                WorkerOutcome::Served { bytes }
            }
            Err(e) => {
                tracing::warn!(worker = %id, error = %e, "transfer abandoned");
                WorkerOutcome::Abandoned(e)
            }
        },
        None => WorkerOutcome::OpenFailed,
    };

    // Socket first, then the file.
    tracing::info!(worker = %id, "closing connection to the client");
    conn.close();
    if let Some(file) = file {
        fatal::close_or_abort(file, "output file");
    }
    outcome
}

/// Open (or create) the client's file for appending.
pub fn open_output(path: &Path, mode: u32) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(mode)
        .open(path)
}

/// Copy `reader` into `writer` in chunks of at most `buffer_size` bytes until
/// end-of-stream. Returns the number of bytes written.
pub fn spool(
    reader: &mut impl Read,
    writer: &mut impl Write,
    buffer_size: usize,
) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TransferError::Read {
                    bytes: total,
                    source: e,
                })
            }
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| TransferError::Write {
                bytes: total,
                source: e,
            })?;
        total += n as u64;
    }
}
