//! Reconcile worker.
//!
//! Scans the cluster store every tick and spawns a pass for each object
//! that is due. A key never has two passes in flight; distinct keys run in
//! parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use ttpair_model::ObjectKey;

use crate::cluster::ObjectRef;
use crate::reconciler::{PassResult, Reconciler};

/// When a key should next be looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Due {
    At(Instant),
    /// Only once the spec generation moves past this one.
    NewGeneration(i64),
}

/// Per-key bookkeeping of the worker.
#[derive(Debug, Default)]
pub struct Schedule {
    in_flight: HashSet<ObjectKey>,
    next: HashMap<ObjectKey, Due>,
}

impl Schedule {
    pub fn is_due(&self, object: &ObjectRef, now: Instant) -> bool {
        if self.in_flight.contains(&object.key) {
            return false;
        }
        match self.next.get(&object.key) {
            None => true,
            Some(Due::At(at)) => now >= *at,
            Some(Due::NewGeneration(seen)) => object.generation != *seen,
        }
    }

    pub fn start(&mut self, key: ObjectKey) {
        self.in_flight.insert(key);
    }

    /// Record a finished pass of `object`.
    pub fn finish(&mut self, object: &ObjectRef, result: &PassResult, now: Instant) {
        self.in_flight.remove(&object.key);
        let due = match result.requeue_after {
            Some(after) => Due::At(now + after),
            None => Due::NewGeneration(object.generation),
        };
        self.next.insert(object.key.clone(), due);
    }

    /// A pass ended without a result; look again on the next tick.
    pub fn abandon(&mut self, key: &ObjectKey) {
        self.in_flight.remove(key);
        self.next.remove(key);
    }

    /// Drop keys that are no longer listed.
    pub fn retain_listed(&mut self, listed: &[ObjectRef]) {
        let keys: HashSet<&ObjectKey> = listed.iter().map(|o| &o.key).collect();
        self.next.retain(|k, _| keys.contains(k));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Drives reconciliation passes until shutdown.
pub struct ReconcileWorker {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl ReconcileWorker {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting reconcile worker"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut schedule = Schedule::default();
        let mut tasks: JoinSet<(ObjectRef, PassResult)> = JoinSet::new();
        let mut running: HashMap<Id, ObjectKey> = HashMap::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan(&mut schedule, &mut tasks, &mut running).await;
                }
                Some(joined) = tasks.join_next_with_id() => {
                    match joined {
                        Ok((id, (object, result))) => {
                            running.remove(&id);
                            if let Some(e) = &result.error {
                                warn!(pair = %object.key, error = %e, "Pass failed");
                            }
                            schedule.finish(&object, &result, Instant::now());
                        }
                        Err(e) => {
                            error!(error = %e, "Pass task panicked");
                            if let Some(key) = running.remove(&e.id()) {
                                schedule.abandon(&key);
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(in_flight = schedule.in_flight(), "Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }

        tasks.shutdown().await;
    }

    async fn scan(
        &self,
        schedule: &mut Schedule,
        tasks: &mut JoinSet<(ObjectRef, PassResult)>,
        running: &mut HashMap<Id, ObjectKey>,
    ) {
        let listed = match self.reconciler.cluster().list_keys().await {
            Ok(listed) => listed,
            Err(e) => {
                error!(error = %e, "Failed to list managed pairs");
                return;
            }
        };
        schedule.retain_listed(&listed);

        let now = Instant::now();
        for object in listed {
            if !schedule.is_due(&object, now) {
                continue;
            }
            debug!(pair = %object.key, "Pass due");
            schedule.start(object.key.clone());
            let key = object.key.clone();
            let reconciler = Arc::clone(&self.reconciler);
            let handle = tasks.spawn(async move {
                let result = reconciler.reconcile(&object.key).await;
                (object, result)
            });
            running.insert(handle.id(), key);
        }
    }
}
