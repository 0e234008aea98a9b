//! Human-in-the-loop approval queue: a process-wide registry of pending
//! requests, each with a single-slot decision channel.
use crate::protocol::Request;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique, monotonically-increasing pending-request ID.
fn next_id() -> String {
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}-{seq:x}")
}

#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: String,
    pub request: Request,
    pub enqueued_at: SystemTime,
}

struct Entry {
    request: Request,
    enqueued_at: SystemTime,
    sender: SyncSender<bool>,
}

#[derive(Default)]
pub struct HitlQueue {
    pending: RwLock<HashMap<String, Entry>>,
}

impl HitlQueue {
    pub fn new() -> Self {
        HitlQueue { pending: RwLock::new(HashMap::new()) }
    }

    /// Enqueue a request and block until a decision arrives or `cancelled`
    /// becomes readable, whichever comes first. On cancellation the entry is
    /// removed and the result is `false` (deny), matching §4.6/§8 semantics.
    pub fn enqueue_and_wait(
        &self,
        request: Request,
        cancel: &Receiver<()>,
    ) -> (String, bool) {
        let (tx, rx) = sync_channel::<bool>(1);
        let id = next_id();
        {
            let mut guard = self.pending.write().unwrap();
            guard.insert(
                id.clone(),
                Entry { request, enqueued_at: SystemTime::now(), sender: tx },
            );
        }

        let decision = loop {
            if let Ok(v) = rx.try_recv() {
                break v;
            }
            if cancel.try_recv().is_ok() {
                break false;
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(v) => break v,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break false,
            }
        };

        self.pending.write().unwrap().remove(&id);
        (id, decision)
    }

    /// Resolve a pending request. Returns whether a send actually occurred;
    /// a second resolve on the same ID (or an unknown ID) is a silent no-op.
    pub fn resolve(&self, id: &str, approve: bool) -> bool {
        let guard = self.pending.read().unwrap();
        match guard.get(id) {
            Some(entry) => entry.sender.try_send(approve).is_ok(),
            None => false,
        }
    }

    pub fn list(&self) -> Vec<QueuedRequest> {
        self.pending
            .read()
            .unwrap()
            .iter()
            .map(|(id, e)| QueuedRequest {
                id: id.clone(),
                request: e.request.clone(),
                enqueued_at: e.enqueued_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Identity;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn sample() -> Request {
        Request {
            command: "echo".into(),
            args: vec!["hi".into()],
            cwd: "/tmp".into(),
            env: Vec::new(),
            identity: Identity::default(),
            container_id: String::new(),
        }
    }

    #[test]
    fn resolve_approve_unblocks_enqueue() {
        let queue = std::sync::Arc::new(HitlQueue::new());
        let (_cancel_tx, cancel_rx) = channel::<()>();
        let q2 = queue.clone();
        let handle = thread::spawn(move || q2.enqueue_and_wait(sample(), &cancel_rx));

        // Give the enqueue a moment to register, then resolve it.
        thread::sleep(StdDuration::from_millis(20));
        let id = queue.list().first().map(|q| q.id.clone());
        assert!(id.is_some());
        assert!(queue.resolve(&id.unwrap(), true));

        let (_, decision) = handle.join().unwrap();
        assert!(decision);
        assert!(queue.is_empty());
    }

    #[test]
    fn no_entry_left_after_handler_returns() {
        let queue = std::sync::Arc::new(HitlQueue::new());
        let (_cancel_tx, cancel_rx) = channel::<()>();
        let q2 = queue.clone();
        let handle = thread::spawn(move || q2.enqueue_and_wait(sample(), &cancel_rx));
        thread::sleep(StdDuration::from_millis(20));
        let id = queue.list().first().unwrap().id.clone();
        queue.resolve(&id, false);
        handle.join().unwrap();
        assert!(queue.list().is_empty());
    }

    #[test]
    fn cancellation_resolves_to_deny() {
        let queue = HitlQueue::new();
        let (cancel_tx, cancel_rx) = channel::<()>();
        cancel_tx.send(()).unwrap();
        let (_id, decision) = queue.enqueue_and_wait(sample(), &cancel_rx);
        assert!(!decision);
    }

    #[test]
    fn second_resolve_on_same_id_is_a_no_op() {
        let queue = std::sync::Arc::new(HitlQueue::new());
        let (_cancel_tx, cancel_rx) = channel::<()>();
        let q2 = queue.clone();
        let handle = thread::spawn(move || q2.enqueue_and_wait(sample(), &cancel_rx));
        thread::sleep(StdDuration::from_millis(20));
        let id = queue.list().first().unwrap().id.clone();
        assert!(queue.resolve(&id, true));
        handle.join().unwrap();
        // Entry is gone now; a second resolve must not panic and returns false.
        assert!(!queue.resolve(&id, true));
    }
}
