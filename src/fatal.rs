/// Process-terminating failures.
///
/// These are failures of operations whose success the server's bookkeeping
/// depends on: a poisoned queue/registry mutex, a signal mask that cannot be
/// changed, or a descriptor we opened ourselves refusing to close. None of
/// them can be handled by abandoning a single connection, so the process
/// logs and aborts.
use nix::errno::Errno;
use std::os::fd::{IntoRawFd, OwnedFd};

/// Log `what` with its cause and abort the process.
pub fn abort(what: &str, cause: &dyn std::fmt::Display) -> ! {
    tracing::error!(error = %cause, "fatal: {what}");
    std::process::abort()
}

/// Close a descriptor the process owns, aborting if the kernel reports failure.
///
/// `EINTR` is treated as closed: on Linux the descriptor is released before
/// the interrupted return, and retrying could close an unrelated descriptor.
pub fn close_or_abort(fd: impl Into<OwnedFd>, what: &str) {
    let raw = fd.into().into_raw_fd();
    match nix::unistd::close(raw) {
        Ok(()) | Err(Errno::EINTR) => {}
        Err(e) => abort(&format!("close {what}"), &e),
    }
}
