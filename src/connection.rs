/// An accepted client: its socket, peer address and sequence number.
///
/// Ownership moves acceptor -> client queue -> exactly one worker. Whoever
/// holds it last closes it with [`Connection::close`].
use crate::fatal;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};

/// Placeholder used in file names when the peer address is unavailable.
pub const UNKNOWN_PEER: &str = "unknown";

#[derive(Debug)]
pub struct Connection {
    id: u64,
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(id: u64, stream: TcpStream, peer: Option<SocketAddr>) -> Self {
        Self { id, stream, peer }
    }

    /// Sequence number assigned by the acceptor.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Peer address for log lines, or the placeholder.
    pub fn peer_display(&self) -> String {
        match self.peer {
            Some(addr) => addr.to_string(),
            None => UNKNOWN_PEER.to_string(),
        }
    }

    /// `<address>_<port>.out`, or `unknown_<id>.out` for an unresolved peer so
    /// two unresolved clients never share a file.
    pub fn output_file_name(&self) -> String {
        match self.peer {
            Some(addr) => format!("{}_{}.out", addr.ip(), addr.port()),
            None => format!("{UNKNOWN_PEER}_{}.out", self.id),
        }
    }

    pub fn output_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.output_file_name())
    }

    /// Close the socket. A failing close aborts the process.
    pub fn close(self) {
        fatal::close_or_abort(self.stream, "client socket");
    }
}
