//! Single background loop matching worker results to waiting callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::job::ResultMessage;
use crate::pending::PendingTable;
use crate::queue::BoundedQueue;

/// Counters maintained by the correlator loop.
#[derive(Debug, Default)]
pub struct CorrelatorStats {
    delivered: AtomicU64,
    discarded: AtomicU64,
}

impl CorrelatorStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Results that arrived after their caller had already given up.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Starts the correlator thread. It exits after reading [`ResultMessage::Stop`].
pub fn spawn(
    results: BoundedQueue<ResultMessage>,
    pending: Arc<PendingTable>,
    stats: Arc<CorrelatorStats>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("response-correlator".to_string())
        .spawn(move || run(&results, &pending, &stats))
}

fn run(results: &BoundedQueue<ResultMessage>, pending: &PendingTable, stats: &CorrelatorStats) {
    info!("response correlator started");
    while let Some(message) = results.get() {
        let item = match message {
            ResultMessage::Result(item) => item,
            ResultMessage::Stop => break,
        };

        let request_id = item.id;
        let failed = item.error().is_some();
        if pending.resolve(item) {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            let discarded = stats.discarded.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                %request_id,
                discarded_total = discarded,
                failed,
                "discarding result for request that is no longer waiting"
            );
        }
    }
    info!("response correlator stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::job::{ResultItem, Timing};

    fn result(id: Uuid) -> ResultMessage {
        ResultMessage::Result(ResultItem {
            id,
            outcome: Ok(id.to_string()),
            timing: Timing::identity_only(0, 0),
        })
    }

    #[tokio::test]
    async fn routes_results_and_discards_unclaimed_ones() {
        let results = BoundedQueue::new(8);
        let pending = Arc::new(PendingTable::new());
        let stats = Arc::new(CorrelatorStats::default());
        let handle = spawn(results.clone(), pending.clone(), stats.clone()).expect("spawn");

        let waiting = Uuid::new_v4();
        let rx = pending.register(waiting).expect("register");
        let orphan = Uuid::new_v4();

        let timeout = Duration::from_secs(1);
        results.put(result(orphan), timeout).expect("put orphan");
        results.put(result(waiting), timeout).expect("put waiting");

        let item = rx.await.expect("resolved").expect("ok");
        assert_eq!(item.text(), Some(waiting.to_string().as_str()));

        results.put(ResultMessage::Stop, timeout).expect("put stop");
        tokio::task::spawn_blocking(move || handle.join())
            .await
            .expect("join task")
            .expect("correlator exits cleanly");

        assert_eq!(stats.delivered(), 1);
        assert_eq!(stats.discarded(), 1);
        assert!(pending.is_empty());
    }
}
