/// Bookkeeping of live worker threads, used to join every worker at shutdown.
///
/// Each entry records who is responsible for joining its thread. A running
/// worker owns its entry until it either retires itself (normal completion
/// before shutdown) or the coordinator claims it in [`WorkerRegistry::join_all`].
/// The ownership flip and the self-retirement both happen under the registry
/// mutex, so a thread is joined by exactly one party.
use crate::fatal;
use crate::shutdown::ShutdownToken;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// Identity of a worker thread, unique for the lifetime of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Worker,
    Coordinator,
}

#[derive(Debug)]
struct Entry {
    handle: Option<JoinHandle<()>>,
    owner: Owner,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    running: HashMap<WorkerId, Entry>,
    /// Handles of workers that removed themselves; joined on the next reap.
    retired: Vec<JoinHandle<()>>,
}

/// Result of a join pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinReport {
    /// Threads joined, including retired ones.
    pub joined: usize,
    /// Of those, how many ended in a panic.
    pub panicked: usize,
}

#[derive(Debug)]
pub struct WorkerRegistry {
    inner: Mutex<Inner>,
    shutdown: ShutdownToken,
}

impl WorkerRegistry {
    pub fn new(shutdown: ShutdownToken) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|e| fatal::abort("worker registry mutex poisoned", &e))
    }

    /// Spawn a thread running `body` and register it.
    ///
    /// The registry lock is held across the spawn, so the new thread cannot
    /// reach [`WorkerRegistry::unregister_if_running`] before its entry exists.
    pub fn spawn<F>(&self, body: F) -> std::io::Result<WorkerId>
    where
        F: FnOnce(WorkerId) + Send + 'static,
    {
        let mut inner = self.lock();
        let id = WorkerId(inner.next_id);
        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || body(id))?;
        inner.next_id += 1;
        Self::insert(&mut inner, id, handle);
        Ok(id)
    }

    fn insert(inner: &mut Inner, id: WorkerId, handle: JoinHandle<()>) {
        let previous = inner.running.insert(
            id,
            Entry {
                handle: Some(handle),
                owner: Owner::Worker,
            },
        );
        debug_assert!(previous.is_none(), "worker {id} registered twice");
    }

    /// Called by a worker on its way out.
    ///
    /// Before shutdown the worker retires its own entry (its handle is joined
    /// later by [`WorkerRegistry::reap_retired`]). Once shutdown has been
    /// requested, or the coordinator has claimed the entry, the entry is left
    /// alone. Returns whether the entry was removed.
    pub fn unregister_if_running(&self, id: WorkerId) -> bool {
        let mut inner = self.lock();
        if self.shutdown.is_triggered() {
            return false;
        }
        match inner.running.get(&id) {
            Some(entry) if entry.owner == Owner::Worker => {}
            _ => return false,
        }
        if let Some(handle) = inner.running.remove(&id).and_then(|e| e.handle) {
            inner.retired.push(handle);
        }
        true
    }

    /// Join workers that already retired themselves.
    pub fn reap_retired(&self) -> JoinReport {
        let retired = std::mem::take(&mut self.lock().retired);
        join_handles(retired)
    }

    /// Claim every remaining entry, join all of them, then empty the registry.
    ///
    /// Call only after the acceptor has stopped spawning workers. Repeats
    /// until a pass finds nothing new, so entries registered late are still
    /// joined.
    pub fn join_all(&self) -> JoinReport {
        let mut report = JoinReport::default();
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut inner = self.lock();
                let mut handles = std::mem::take(&mut inner.retired);
                for entry in inner.running.values_mut() {
                    entry.owner = Owner::Coordinator;
                    handles.extend(entry.handle.take());
                }
                handles
            };
            if handles.is_empty() {
                break;
            }
            tracing::debug!(count = handles.len(), "joining worker threads");
            let pass = join_handles(handles);
            report.joined += pass.joined;
            report.panicked += pass.panicked;
        }
        self.lock()
            .running
            .retain(|_, entry| entry.owner == Owner::Worker);
        report
    }

    /// Entries still owned by a running worker or awaiting the coordinator.
    pub fn len(&self) -> usize {
        self.lock().running.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn join_handles(handles: Vec<JoinHandle<()>>) -> JoinReport {
    let mut report = JoinReport::default();
    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        report.joined += 1;
        if handle.join().is_err() {
            tracing::warn!(thread = %name, "worker thread panicked");
            report.panicked += 1;
        }
    }
    report
}
