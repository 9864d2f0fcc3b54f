//! Offloading CPU-bound work to tokio's blocking pool.
//!
//! The work runs off the scheduler; its continuation is sent back over a
//! channel and runs on the scheduler like any other queued action. The
//! current epoch is held open in between.

use std::sync::Arc;

use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinError,
};
use tracing::{trace, warn};

use crate::{
    runtime::{Action, Runtime},
    termination::epoch::EpochId,
};

pub(crate) struct WorkerState {
    tx: mpsc::UnboundedSender<(EpochId, Action)>,
    pub rx: mpsc::UnboundedReceiver<(EpochId, Action)>,
    permits: Option<Arc<Semaphore>>,
}

impl WorkerState {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            permits: (threads > 0).then(|| Arc::new(Semaphore::new(threads))),
        }
    }
}

impl Runtime {
    /// Runs `work` off the scheduler, at most `worker_threads` at a time, and
    /// `then` with its result back on the scheduler. With offloading disabled
    /// both run right away.
    pub fn offload<R, W, F>(&mut self, work: W, then: F)
    where
        R: Send + 'static,
        W: FnOnce() -> R + Send + 'static,
        F: FnOnce(&mut Runtime, R) + Send + 'static,
    {
        let permits = match &self.worker.permits {
            Some(permits) => permits.clone(),
            None => {
                let result = work();
                then(self, result);
                return;
            }
        };
        let epoch = self.current_epoch();
        self.produce(epoch, 1);
        let tx = self.worker.tx.clone();
        tokio::spawn(async move {
            // the semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            let action = completion(tokio::task::spawn_blocking(work).await, then);
            trace!("offloaded work done");
            if tx.send((epoch, action)).is_err() {
                warn!("offloaded work in epoch {} finished after its runtime went away", epoch);
            }
        });
    }
}

/// The action that brings a finished piece of work back to the scheduler.
/// Every outcome yields one, since running it consumes the held epoch.
fn completion<R, F>(joined: Result<R, JoinError>, then: F) -> Action
where
    R: Send + 'static,
    F: FnOnce(&mut Runtime, R) + Send + 'static,
{
    match joined {
        Ok(result) => Box::new(move |rt: &mut Runtime| then(rt, result)),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            Box::new(move |_: &mut Runtime| std::panic::resume_unwind(panic))
        }
        Err(e) => {
            let reason = e.to_string();
            Box::new(move |rt: &mut Runtime| {
                warn!("offloaded work on node {} did not finish: {}", rt.this_node(), reason)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use crate::{world, RuntimeConfig};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offloaded_results_come_back_inside_the_epoch() {
        world::init_test_tracing();
        let sum = Arc::new(AtomicU64::new(0));
        let total = sum.clone();
        world::launch(
            2,
            RuntimeConfig::builder().worker_threads(2).build(),
            |_| (),
            move |mut rt, _| {
                let total = total.clone();
                async move {
                    rt.initialize().await?;
                    let epoch = rt.collective_scope(|rt| {
                        for k in 1..=10u64 {
                            let total = total.clone();
                            rt.offload(
                                move || (1..=k).product::<u64>(),
                                move |_, v| {
                                    total.fetch_add(v, Ordering::SeqCst);
                                },
                            );
                        }
                    });
                    rt.wait_epoch(epoch).await?;
                    rt.finalize().await
                }
            },
        )
        .await
        .unwrap();
        let factorials: u64 = (1..=10u64).map(|k| (1..=k).product::<u64>()).sum();
        assert_eq!(sum.load(Ordering::SeqCst), 2 * factorials);
    }

    #[tokio::test]
    async fn cancelled_work_still_releases_its_epoch() {
        let transport = crate::LocalWorld::endpoints(1).pop().unwrap();
        let mut rt = crate::Runtime::new(
            RuntimeConfig::default(),
            transport,
            crate::HandlerRegistry::builder().build(),
        );
        rt.initialize().await.unwrap();
        let epoch = rt.make_epoch_rooted();
        // what offload holds while the work is out
        rt.produce(epoch, 1);
        let aborted = tokio::spawn(std::future::pending::<u64>());
        aborted.abort();
        let cancelled = aborted.await;
        assert!(cancelled.is_err());
        let action = super::completion(cancelled, |_, _: u64| panic!("continuation of cancelled work ran"));
        rt.enqueue(crate::runtime::Work::Action { epoch, action });
        rt.finish_epoch(epoch);
        rt.wait_epoch(epoch).await.unwrap();
        rt.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_offload_runs_inline() {
        let transport = crate::LocalWorld::endpoints(1).pop().unwrap();
        let mut rt = crate::Runtime::new(
            RuntimeConfig::default(),
            transport,
            crate::HandlerRegistry::builder().build(),
        );
        let hit = Arc::new(AtomicU64::new(0));
        let seen = hit.clone();
        rt.offload(|| 41, move |_, v| seen.store(v + 1, Ordering::SeqCst));
        assert_eq!(hit.load(Ordering::SeqCst), 42);
    }
}
