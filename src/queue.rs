//! `ServicesQueue`: bounded multi-producer/single-consumer queue of
//! [`ServiceRecord`]s plus aggregated `problems` (spec §4.C).
//!
//! Completion is modeled the idiomatic Rust way instead of via an explicit
//! counter check on the consumer side: the producer-facing
//! [`DiscoveryResultSink`] is `Clone`, one clone is handed to every in-flight
//! probe and dropped when that probe's task ends, and the
//! [`DiscoveryEngine`](crate::discovery::DiscoveryEngine) holds one more clone
//! for the lifetime of the whole two-phase attempt. Once every clone is gone
//! — including the attempt's own, dropped via [`DiscoveryResultSink::complete`]
//! — the channel closes and `take_service` returns `None`, exactly the "all
//! producers have signaled completion" contract from the spec.
//! `complete(self)` takes the sink by value, so calling it twice is a compile
//! error rather than a runtime idempotence concern.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use url::Url;

use crate::record::ServiceRecord;

/// A single accumulated probe failure (spec §4.D/§7).
#[derive(Debug, Clone)]
pub struct Problem {
    pub uri: Option<Url>,
    pub message: String,
}

/// Producer-facing handle: probes and the engine's match pass push records
/// and report problems through clones of this handle.
#[derive(Clone)]
pub struct DiscoveryResultSink {
    tx: mpsc::Sender<ServiceRecord>,
    problems: Arc<Mutex<Vec<Problem>>>,
}

impl DiscoveryResultSink {
    /// Push a matching record. The queue is bounded (spec §4.C); if it is
    /// momentarily full the record is dropped and surfaced as a problem
    /// rather than blocking the producer (probes never fatally fail per
    /// spec §4.D, so this stays non-blocking too).
    pub fn push(&self, record: ServiceRecord) {
        if self.tx.try_send(record).is_err() {
            self.report_problem(None, "services queue full or closed; record dropped");
        }
    }

    pub fn report_problem(&self, uri: Option<Url>, message: impl Into<String>) {
        self.problems.lock().unwrap().push(Problem {
            uri,
            message: message.into(),
        });
    }

    /// Release this handle's hold on the queue. Called exactly once, by the
    /// `DiscoveryAttempt` that owns the overall fan-out, once `outstanding`
    /// has reached zero for good (spec §4.D).
    pub fn complete(self) {}
}

/// Consumer-facing handle, owned by the [`Resolver`](crate::resolver::Resolver).
pub struct ServicesQueue {
    rx: mpsc::Receiver<ServiceRecord>,
    problems: Arc<Mutex<Vec<Problem>>>,
}

impl ServicesQueue {
    /// Blocks (asynchronously) until a record is available or every producer
    /// has completed, in which case it returns `None`.
    pub async fn take_service(&mut self) -> Option<ServiceRecord> {
        self.rx.recv().await
    }

    /// Drains every remaining record until completion.
    pub async fn drain_all(&mut self) -> Vec<ServiceRecord> {
        let mut records = Vec::new();
        while let Some(record) = self.take_service().await {
            records.push(record);
        }
        records
    }

    /// Accumulated failures observed so far. Meaningful once the stream is
    /// drained, but safe to call at any time.
    pub fn problems(&self) -> Vec<Problem> {
        self.problems.lock().unwrap().clone()
    }
}

/// Create a linked `(sink, queue)` pair with the given bound.
pub fn services_queue(capacity: usize) -> (DiscoveryResultSink, ServicesQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let problems = Arc::new(Mutex::new(Vec::new()));
    (
        DiscoveryResultSink {
            tx,
            problems: problems.clone(),
        },
        ServicesQueue { rx, problems },
    )
}
