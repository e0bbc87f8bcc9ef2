//! Strictly serialized work queue for one header-bidding partner.

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};

type Job = (u64, LocalBoxFuture<'static, ()>);

#[derive(Debug, Default)]
struct QueueState {
    active: Cell<Option<u64>>,
    pending: Cell<usize>,
    completed: Cell<u64>,
    next_ticket: Cell<u64>,
}

/// FIFO queue with a single active task. A job starts only after the previous
/// job, including everything it awaited, has finished.
///
/// The worker is spawned on first use and must run inside a
/// [`tokio::task::LocalSet`].
pub struct PartnerQueue {
    name: String,
    sender: RefCell<Option<mpsc::UnboundedSender<Job>>>,
    state: Rc<QueueState>,
}

impl PartnerQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sender: RefCell::new(None),
            state: Rc::new(QueueState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ticket of the job currently running, if any.
    pub fn active(&self) -> Option<u64> {
        self.state.active.get()
    }

    /// Jobs submitted but not yet started.
    pub fn pending(&self) -> usize {
        self.state.pending.get()
    }

    pub fn completed(&self) -> u64 {
        self.state.completed.get()
    }

    /// Append `work` to the queue. The returned future yields its output, or
    /// `None` if the queue shut down before the job ran.
    pub fn submit<F, T>(&self, work: F) -> impl Future<Output = Option<T>>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let ticket = self.state.next_ticket.get();
        self.state.next_ticket.set(ticket + 1);

        let (done_tx, done_rx) = oneshot::channel();
        let job = async move {
            let _ = done_tx.send(work.await);
        }
        .boxed_local();

        self.state.pending.set(self.state.pending.get() + 1);
        if self.sender().send((ticket, job)).is_err() {
            log::error!("Queue: worker for {} is gone", self.name);
            self.state.pending.set(self.state.pending.get() - 1);
        }
        async move { done_rx.await.ok() }
    }

    fn sender(&self) -> mpsc::UnboundedSender<Job> {
        let mut slot = self.sender.borrow_mut();
        if let Some(tx) = slot.as_ref().filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_local(run_worker(self.name.clone(), rx, self.state.clone()));
        *slot = Some(tx.clone());
        tx
    }
}

async fn run_worker(name: String, mut rx: mpsc::UnboundedReceiver<Job>, state: Rc<QueueState>) {
    while let Some((ticket, job)) = rx.recv().await {
        state.pending.set(state.pending.get().saturating_sub(1));
        state.active.set(Some(ticket));
        log::trace!("Queue: {} running job {}", name, ticket);
        job.await;
        state.active.set(None);
        state.completed.set(state.completed.get() + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::LocalSet;

    #[tokio::test(start_paused = true)]
    async fn jobs_run_one_at_a_time_in_order() {
        LocalSet::new()
            .run_until(async {
                let queue = PartnerQueue::new("aps");
                let log: Rc<RefCell<Vec<String>>> = Rc::default();

                let mut outputs = Vec::new();
                for (i, delay) in [30u64, 5, 10].into_iter().enumerate() {
                    let log = log.clone();
                    outputs.push(queue.submit(async move {
                        log.borrow_mut().push(format!("start {}", i));
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        log.borrow_mut().push(format!("end {}", i));
                        i
                    }));
                }
                assert_eq!(queue.pending(), 3);

                let results = futures::future::join_all(outputs).await;
                assert_eq!(results, vec![Some(0), Some(1), Some(2)]);
                assert_eq!(
                    *log.borrow(),
                    vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
                );
                tokio::task::yield_now().await;
                assert_eq!(queue.active(), None);
                assert_eq!(queue.pending(), 0);
                assert_eq!(queue.completed(), 3);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn active_points_at_running_job() {
        LocalSet::new()
            .run_until(async {
                let queue = PartnerQueue::new("prebid");
                let (release_tx, release_rx) = oneshot::channel::<()>();
                let first = queue.submit(async move {
                    let _ = release_rx.await;
                });
                let second = queue.submit(async {});
                tokio::task::yield_now().await;

                assert_eq!(queue.active(), Some(0));
                assert_eq!(queue.pending(), 1);

                release_tx.send(()).unwrap();
                first.await;
                second.await;
                assert_eq!(queue.completed(), 2);
            })
            .await;
    }
}
