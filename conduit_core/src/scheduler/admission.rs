use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Result of an admission request.
#[derive(Debug, PartialEq)]
pub enum Admit<T> {
    /// A slot was reserved; the caller must start the job and later `release`.
    Admitted(T),
    /// Waiting in the FIFO queue at `position` (0 = next).
    Queued { position: usize },
    /// Over a limit and not allowed to queue.
    Rejected(T, Saturation),
}

/// Which limit turned a request away.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Saturation {
    /// The connector is at its own concurrency limit.
    Connector,
    /// The platform-wide cap is reached.
    Global,
}

struct Waiting<T> {
    connector_id: String,
    limit: usize,
    item: T,
}

struct AdmissionState<T> {
    running: HashMap<String, usize>,
    total: usize,
    queue: VecDeque<Waiting<T>>,
}

/// Concurrency limits enforced before a job reaches RUNNING: a per-connector
/// limit plus an optional platform-wide cap, with a FIFO queue for requests
/// that may wait.
///
/// The lock is never held across an await.
pub struct AdmissionQueue<T> {
    global_max: Option<usize>,
    state: Mutex<AdmissionState<T>>,
}

impl<T> AdmissionQueue<T> {
    pub fn new(global_max: Option<usize>) -> Self {
        Self {
            global_max,
            state: Mutex::new(AdmissionState {
                running: HashMap::new(),
                total: 0,
                queue: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState<T>> {
        // Admission bookkeeping stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn fits(&self, state: &AdmissionState<T>, connector_id: &str, limit: usize) -> bool {
        self.saturation(state, connector_id, limit).is_none()
    }

    fn saturation(
        &self,
        state: &AdmissionState<T>,
        connector_id: &str,
        limit: usize,
    ) -> Option<Saturation> {
        let running = state.running.get(connector_id).copied().unwrap_or(0);
        if running >= limit.max(1) {
            return Some(Saturation::Connector);
        }
        if self.global_max.is_some_and(|g| state.total >= g) {
            return Some(Saturation::Global);
        }
        None
    }

    fn reserve(state: &mut AdmissionState<T>, connector_id: &str) {
        *state.running.entry(connector_id.to_string()).or_default() += 1;
        state.total += 1;
    }

    /// Reserve a slot for `connector_id` or queue/reject the request.
    ///
    /// Requests never overtake queued work for the same connector. Queued
    /// work for other connectors only waits on its own limit or on a full
    /// global cap, so it never blocks an idle connector.
    pub fn try_admit(&self, connector_id: &str, limit: usize, item: T, may_queue: bool) -> Admit<T> {
        let mut state = self.lock();
        let queued_ahead = state.queue.iter().any(|w| w.connector_id == connector_id);
        let saturation = if queued_ahead {
            Some(Saturation::Connector)
        } else {
            self.saturation(&state, connector_id, limit)
        };
        let Some(saturation) = saturation else {
            Self::reserve(&mut state, connector_id);
            return Admit::Admitted(item);
        };
        if !may_queue {
            return Admit::Rejected(item, saturation);
        }
        state.queue.push_back(Waiting {
            connector_id: connector_id.to_string(),
            limit,
            item,
        });
        Admit::Queued {
            position: state.queue.len() - 1,
        }
    }

    /// Free a slot and admit whatever queued work now fits, in FIFO order.
    pub fn release(&self, connector_id: &str) -> Vec<T> {
        let mut state = self.lock();
        if let Some(n) = state.running.get_mut(connector_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                state.running.remove(connector_id);
            }
            state.total = state.total.saturating_sub(1);
        }

        let mut admitted = Vec::new();
        let mut i = 0;
        while i < state.queue.len() {
            let (cid, limit) = {
                let w = &state.queue[i];
                (w.connector_id.clone(), w.limit)
            };
            if self.fits(&state, &cid, limit) {
                if let Some(w) = state.queue.remove(i) {
                    Self::reserve(&mut state, &cid);
                    admitted.push(w.item);
                }
                continue;
            }
            if self.global_max.is_some_and(|g| state.total >= g) {
                break;
            }
            i += 1;
        }
        admitted
    }

    /// Take one queued request out of the queue.
    pub fn remove_queued(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut state = self.lock();
        let idx = state.queue.iter().position(|w| pred(&w.item))?;
        state.queue.remove(idx).map(|w| w.item)
    }

    pub fn drain_queued(&self) -> Vec<T> {
        self.lock().queue.drain(..).map(|w| w.item).collect()
    }

    pub fn running(&self, connector_id: &str) -> usize {
        self.lock().running.get(connector_id).copied().unwrap_or(0)
    }

    pub fn total_running(&self) -> usize {
        self.lock().total
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn per_connector_limit_queues_in_fifo_order() {
        let q = AdmissionQueue::new(None);
        assert_eq!(q.try_admit("pg", 1, 1, true), Admit::Admitted(1));
        assert_eq!(q.try_admit("pg", 1, 2, true), Admit::Queued { position: 0 });
        assert_eq!(q.try_admit("pg", 1, 3, true), Admit::Queued { position: 1 });
        // Other connectors are unaffected.
        assert_eq!(q.try_admit("mysql", 1, 4, true), Admit::Admitted(4));

        assert_eq!(q.release("pg"), vec![2]);
        assert_eq!(q.running("pg"), 1);
        assert_eq!(q.release("pg"), vec![3]);
        assert!(q.release("pg").is_empty());
        assert_eq!(q.running("pg"), 0);
    }

    #[test]
    fn manual_requests_are_rejected_when_busy() {
        let q = AdmissionQueue::new(None);
        assert_eq!(q.try_admit("pg", 1, 1, false), Admit::Admitted(1));
        assert_eq!(
            q.try_admit("pg", 1, 2, false),
            Admit::Rejected(2, Saturation::Connector)
        );
        assert_eq!(q.queued(), 0);
    }

    #[test]
    fn global_cap_applies_across_connectors() {
        let q = AdmissionQueue::new(Some(2));
        assert_eq!(q.try_admit("a", 5, 1, true), Admit::Admitted(1));
        assert_eq!(q.try_admit("b", 5, 2, true), Admit::Admitted(2));
        assert_eq!(q.try_admit("c", 5, 3, true), Admit::Queued { position: 0 });
        assert_eq!(q.total_running(), 2);
        assert_eq!(q.release("a"), vec![3]);
        assert_eq!(q.running("c"), 1);
    }

    #[test]
    fn queued_work_does_not_block_an_idle_connector() {
        let q = AdmissionQueue::new(Some(10));
        assert_eq!(q.try_admit("a", 1, 1, true), Admit::Admitted(1));
        assert_eq!(q.try_admit("a", 1, 2, true), Admit::Queued { position: 0 });
        // Free global slots: "b" is admitted whether or not it may queue.
        assert_eq!(q.try_admit("b", 1, 3, false), Admit::Admitted(3));
        assert_eq!(q.try_admit("c", 1, 4, true), Admit::Admitted(4));
        assert_eq!(q.total_running(), 3);
        assert_eq!(q.queued(), 1);
    }

    #[test]
    fn rejection_names_the_limit_that_was_hit() {
        let q = AdmissionQueue::new(Some(2));
        assert_eq!(q.try_admit("a", 1, 1, false), Admit::Admitted(1));
        assert_eq!(
            q.try_admit("a", 1, 2, false),
            Admit::Rejected(2, Saturation::Connector)
        );
        assert_eq!(q.try_admit("b", 1, 3, false), Admit::Admitted(3));
        assert_eq!(
            q.try_admit("c", 1, 4, false),
            Admit::Rejected(4, Saturation::Global)
        );
    }

    #[test]
    fn queued_items_can_be_withdrawn() {
        let q = AdmissionQueue::new(None);
        q.try_admit("pg", 1, 1, true);
        q.try_admit("pg", 1, 2, true);
        q.try_admit("pg", 1, 3, true);
        assert_eq!(q.remove_queued(|i| *i == 2), Some(2));
        assert_eq!(q.remove_queued(|i| *i == 2), None);
        assert_eq!(q.release("pg"), vec![3]);
    }

    proptest! {
        /// Concurrent bursts never admit more than the limit.
        #[test]
        fn bursts_respect_the_limit(n in 1usize..40, limit in 1usize..4) {
            let q = AdmissionQueue::new(None);
            let results: Vec<Admit<usize>> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..n)
                    .map(|i| {
                        let q = &q;
                        s.spawn(move || q.try_admit("pg", limit, i, false))
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            let admitted = results.iter().filter(|r| matches!(r, Admit::Admitted(_))).count();
            let rejected = results.iter().filter(|r| matches!(r, Admit::Rejected(_, Saturation::Connector))).count();
            prop_assert_eq!(admitted, n.min(limit));
            prop_assert_eq!(rejected, n - n.min(limit));
            prop_assert_eq!(q.running("pg"), n.min(limit));
        }
    }
}
