//! Serialized market queue.
//!
//! Money-moving operations enter a FIFO lane keyed by (market, option) before
//! touching the database, so at most one operation runs per key at a time.
//! Market-scoped operations (liquidity, resolution submissions) use a `None`
//! option and serialize against each other; cross-market work runs in
//! parallel. A tokio mutex queues waiters fairly, which is what gives the
//! lane its FIFO order.

use crate::error::TransactionError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub type QueueKey = (i64, Option<i64>);

#[derive(Default)]
pub struct MarketQueue {
    lanes: Mutex<HashMap<QueueKey, Arc<AsyncMutex<()>>>>,
}

impl MarketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, key: QueueKey) -> Arc<AsyncMutex<()>> {
        let mut lanes = self.lanes.lock().expect("queue lane map poisoned");
        lanes.entry(key).or_default().clone()
    }

    /// Drop the lane if nobody else holds it. Runs under the map lock so no
    /// concurrent caller can clone a lane that is about to be removed.
    fn release(&self, key: QueueKey, lane: &Arc<AsyncMutex<()>>) {
        let mut lanes = self.lanes.lock().expect("queue lane map poisoned");
        if Arc::strong_count(lane) == 2 {
            lanes.remove(&key);
        }
    }

    /// Run `op` holding the key's lane. The timeout bounds only the wait for
    /// the lane; once an operation starts it runs to completion.
    pub async fn run<T, F>(&self, key: QueueKey, timeout: Duration, op: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let lane = self.lane(key);
        let guard = match tokio::time::timeout(timeout, lane.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.release(key, &lane);
                return Err(anyhow::Error::new(TransactionError::QueueTimeout(
                    timeout.as_millis() as u64,
                )));
            }
        };
        let result = op.await;
        drop(guard);
        self.release(key, &lane);
        result
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.lock().expect("queue lane map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_transaction_error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: QueueKey = (1, Some(1));
    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn same_key_runs_in_submission_order() {
        let queue = Arc::new(MarketQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(KEY, WAIT, async {
                        order.lock().unwrap().push(i);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(())
                    })
                    .await
            }));
            // give the task a beat to enqueue before the next one
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let queue = Arc::new(MarketQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for market in 0..4i64 {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run((market, None), WAIT, async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1, "keys did not overlap");
    }

    #[tokio::test]
    async fn waiting_past_timeout_is_a_queue_timeout() {
        let queue = Arc::new(MarketQueue::new());

        let holder = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(KEY, WAIT, async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = queue
            .run(KEY, Duration::from_millis(30), async { Ok(()) })
            .await
            .unwrap_err();
        let te = as_transaction_error(&err).expect("typed error");
        assert_eq!(te.kind(), "QueueTimeout");

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_lanes_are_swept() {
        let queue = MarketQueue::new();
        queue.run(KEY, WAIT, async { Ok(()) }).await.unwrap();
        queue.run((2, None), WAIT, async { Ok(()) }).await.unwrap();
        assert_eq!(queue.lane_count(), 0);
    }

    #[tokio::test]
    async fn op_errors_pass_through() {
        let queue = MarketQueue::new();
        let err = queue
            .run(KEY, WAIT, async {
                Err::<(), _>(anyhow::anyhow!("inner failure"))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("inner failure"));
        // lane is free again
        queue.run(KEY, WAIT, async { Ok(()) }).await.unwrap();
    }
}
