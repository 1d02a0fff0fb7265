/// FIFO hand-off between the acceptor and the worker threads.
///
/// One mutex guards the whole sequence and one condition variable wakes
/// waiting workers. There is no capacity limit; pacing new connections is the
/// acceptor's job.
use crate::connection::Connection;
use crate::fatal;
use crate::shutdown::ShutdownToken;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Connection>,
    closed: bool,
}

#[derive(Debug)]
pub struct ClientQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    shutdown: ShutdownToken,
}

impl ClientQueue {
    pub fn new(shutdown: ShutdownToken) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|e| fatal::abort("client queue mutex poisoned", &e))
    }

    /// Append to the tail and wake one waiting worker.
    ///
    /// Once the queue has been closed the connection is handed back so the
    /// caller can close it.
    pub fn push(&self, conn: Connection) -> Result<(), Connection> {
        let mut state = self.lock();
        if state.closed {
            return Err(conn);
        }
        state.items.push_back(conn);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Remove the head, blocking while the queue is empty.
    ///
    /// Returns `None` only when shutdown has been requested and nothing is
    /// left to hand out.
    pub fn pop(&self) -> Option<Connection> {
        let mut state = self.lock();
        loop {
            if let Some(conn) = state.items.pop_front() {
                return Some(conn);
            }
            if self.shutdown.is_triggered() {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|e| fatal::abort("client queue mutex poisoned", &e));
        }
    }

    /// Reject further pushes and wake every waiting worker.
    ///
    /// Must be called after the shutdown token was triggered: taking the lock
    /// here orders the wake-up after any waiter's check of the token.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Close every connection still queued. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let drained: Vec<Connection> = self.lock().items.drain(..).collect();
        let count = drained.len();
        for conn in drained {
            conn.close();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
