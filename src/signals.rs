/// Signal handling for graceful shutdown.
///
/// SIGINT and SIGPIPE are blocked on the main thread before any worker is
/// spawned, so every worker inherits the block. The acceptor waits with
/// [`wait_readable`], which atomically swaps in a mask that lets SIGINT
/// through only for the duration of the wait. The handler just records the
/// interrupt; the acceptor translates that record into a
/// [`ShutdownToken`](crate::shutdown::ShutdownToken) request.
use crate::fatal;
use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::time::TimeSpec;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: i32) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Whether SIGINT has been delivered since [`SignalState::install`].
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Signals kept away from worker threads.
pub fn blocked_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGPIPE);
    set
}

/// Saved process signal state, restored by [`SignalState::restore`].
pub struct SignalState {
    previous_mask: SigSet,
    /// Previous mask plus SIGPIPE, minus SIGINT: what the acceptor waits with.
    wait_mask: SigSet,
    previous_action: SigAction,
}

impl SignalState {
    /// Install the SIGINT handler and block SIGINT/SIGPIPE on this thread.
    ///
    /// Must run on the main thread before any worker is spawned.
    pub fn install() -> Self {
        INTERRUPTED.store(false, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(on_interrupt),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        let previous_action = unsafe { signal::sigaction(Signal::SIGINT, &action) }
            .unwrap_or_else(|e| fatal::abort("sigaction(SIGINT)", &e));

        let mut previous_mask = SigSet::empty();
        signal::pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&blocked_set()),
            Some(&mut previous_mask),
        )
        .unwrap_or_else(|e| fatal::abort("block SIGINT/SIGPIPE", &e));

        let mut wait_mask = previous_mask;
        wait_mask.add(Signal::SIGPIPE);
        wait_mask.remove(Signal::SIGINT);

        tracing::debug!("signal handling installed");
        Self {
            previous_mask,
            wait_mask,
            previous_action,
        }
    }

    pub fn wait_mask(&self) -> SigSet {
        self.wait_mask
    }

    /// Put back the original mask, then the original SIGINT disposition.
    ///
    /// The mask goes first: a SIGINT that arrived during cleanup is then
    /// delivered to our own handler instead of the default one.
    pub fn restore(self) {
        signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous_mask), None)
            .unwrap_or_else(|e| fatal::abort("restore signal mask", &e));
        // SAFETY: reinstates the disposition that was in place before `install`.
        unsafe { signal::sigaction(Signal::SIGINT, &self.previous_action) }
            .unwrap_or_else(|e| fatal::abort("restore SIGINT action", &e));
    }
}

/// Per-thread block of SIGINT/SIGPIPE, undone on drop.
pub struct ThreadSignalBlock {
    previous: SigSet,
}

impl ThreadSignalBlock {
    pub fn block() -> Self {
        let mut previous = SigSet::empty();
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked_set()), Some(&mut previous))
            .unwrap_or_else(|e| fatal::abort("pthread_sigmask", &e));
        Self { previous }
    }
}

impl Drop for ThreadSignalBlock {
    fn drop(&mut self) {
        signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None)
            .unwrap_or_else(|e| fatal::abort("pthread_sigmask", &e));
    }
}

/// Outcome of waiting on the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A connection is waiting to be accepted.
    Ready,
    /// Timed out or interrupted; re-check the shutdown state.
    Idle,
}

/// Wait until `fd` is readable, a signal arrives, or `timeout` passes.
///
/// `mask` is installed only for the duration of the wait; `None` keeps the
/// caller's mask.
pub fn wait_readable(
    fd: &impl AsFd,
    timeout: Duration,
    mask: Option<SigSet>,
) -> nix::Result<Readiness> {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    match ppoll(&mut fds, Some(TimeSpec::from(timeout)), mask) {
        Ok(0) | Err(Errno::EINTR) => Ok(Readiness::Idle),
        Ok(_) => Ok(Readiness::Ready),
        Err(e) => Err(e),
    }
}

/// Sleep for `timeout` under `mask`, returning early if a signal arrives.
pub fn pause(timeout: Duration, mask: Option<SigSet>) -> nix::Result<()> {
    match ppoll(&mut [], Some(TimeSpec::from(timeout)), mask) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    #[test]
    fn test_blocked_set_contents() {
        let set = blocked_set();
        assert!(set.contains(Signal::SIGINT));
        assert!(set.contains(Signal::SIGPIPE));
        assert!(!set.contains(Signal::SIGTERM));
    }

    #[test]
    fn test_thread_block_is_scoped() {
        std::thread::spawn(|| {
            let before = SigSet::thread_get_mask().unwrap();
            assert!(!before.contains(Signal::SIGINT));
            {
                let _block = ThreadSignalBlock::block();
                let during = SigSet::thread_get_mask().unwrap();
                assert!(during.contains(Signal::SIGINT));
                assert!(during.contains(Signal::SIGPIPE));
            }
            let after = SigSet::thread_get_mask().unwrap();
            assert!(!after.contains(Signal::SIGINT));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_wait_readable_times_out_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let r = wait_readable(&listener, Duration::from_millis(20), None).unwrap();
        assert_eq!(r, Readiness::Idle);
    }

    #[test]
    fn test_wait_readable_sees_pending_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let r = wait_readable(&listener, Duration::from_secs(5), None).unwrap();
        assert_eq!(r, Readiness::Ready);
    }

    #[test]
    fn test_pause_waits_out_timeout() {
        let started = Instant::now();
        pause(Duration::from_millis(30), None).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}
