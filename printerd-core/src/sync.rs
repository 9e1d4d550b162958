use crate::errors::ExecutionError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};

// ─── Ordered mutex ────────────────────────────────────────────

/// A fair FIFO asynchronous mutex. Unlike the runtime's own mutex, a waiter
/// takes its queue position the moment `enqueue` is called, not when the
/// returned future is first polled. The admission/completion ordering
/// invariants depend on fixing a finish-queue position while the start lock
/// is still held, which requires exactly this.
#[derive(Debug, Default)]
pub struct OrderedMutex {
    state: Mutex<LockState>,
}

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl OrderedMutex {
    pub fn new() -> Arc<OrderedMutex> {
        Arc::new(OrderedMutex::default())
    }

    /// Registers a queue position and returns a ticket that resolves to the
    /// guard once every earlier ticket has been served. Dropping the ticket
    /// abandons the position.
    pub fn enqueue(self: &Arc<OrderedMutex>) -> Ticket {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.held {
                state.waiters.push_back(tx);
            } else {
                state.held = true;
                // Hand the lock to this ticket immediately.
                let _ = tx.send(());
            }
        }
        Ticket {
            lock: self.clone(),
            rx: Some(rx),
        }
    }

    /// Convenience: enqueue and wait in one step.
    pub async fn acquire(self: &Arc<OrderedMutex>) -> OrderedGuard {
        self.enqueue().wait().await
    }

    fn release(self: &Arc<OrderedMutex>) {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.waiters.pop_front() {
                // A send only fails when the ticket was dropped; skip it.
                Some(next) => {
                    if next.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.held = false;
                    return;
                }
            }
        }
    }
}

/// A pending queue position on an `OrderedMutex`.
#[derive(Debug)]
pub struct Ticket {
    lock: Arc<OrderedMutex>,
    rx: Option<oneshot::Receiver<()>>,
}

impl Ticket {
    /// The receiver stays inside `self` while waiting so that dropping this
    /// future mid-await still runs the ticket cleanup below.
    pub async fn wait(mut self) -> OrderedGuard {
        let acquired = match self.rx.as_mut() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        };
        if acquired {
            self.rx = None;
            OrderedGuard {
                lock: self.lock.clone(),
            }
        } else {
            // Senders live in the queue until served; the queue lives as
            // long as this ticket's Arc.
            unreachable!("ordered mutex dropped with waiters pending")
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            // The handoff may already have happened; give the lock back.
            if rx.try_recv().is_ok() {
                self.lock.release();
            }
        }
    }
}

#[derive(Debug)]
pub struct OrderedGuard {
    lock: Arc<OrderedMutex>,
}

impl Drop for OrderedGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// ─── Cancellation ─────────────────────────────────────────────

/// Cancellation fan-out for one channel, linked to the process-wide source.
/// `cancel` fires every token handed out so far; the owner then swaps in a
/// fresh source so later codes are unaffected.
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
    global: watch::Receiver<bool>,
}

impl CancellationSource {
    pub fn new(global: watch::Receiver<bool>) -> CancellationSource {
        let (tx, _) = watch::channel(false);
        CancellationSource { tx, global }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            channel: self.tx.subscribe(),
            global: self.global.clone(),
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone, Debug)]
pub struct CancellationToken {
    channel: watch::Receiver<bool>,
    global: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.channel.borrow() || *self.global.borrow()
    }

    /// Resolves once this token is cancelled. A closed source counts as
    /// cancelled.
    pub async fn cancelled(&self) {
        let mut channel = self.channel.clone();
        let mut global = self.global.clone();
        tokio::select! {
            _ = channel.wait_for(|v| *v) => {}
            _ = global.wait_for(|v| *v) => {}
        }
    }
}

/// Runs a future to completion unless the token fires first.
pub async fn with_cancel<F, T>(token: &CancellationToken, fut: F) -> Result<T, ExecutionError>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return Err(ExecutionError::Cancelled);
    }
    tokio::select! {
        biased;
        value = fut => Ok(value),
        _ = token.cancelled() => Err(ExecutionError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    #[tokio::test]
    async fn tickets_drain_in_enqueue_order() {
        let lock = OrderedMutex::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = lock.enqueue();
        let t2 = lock.enqueue();
        let t3 = lock.enqueue();

        let guard = first.wait().await;

        let mut tasks = Vec::new();
        for (i, ticket) in [(2, t2), (3, t3)] {
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = ticket.wait().await;
                order.lock().unwrap().push(i);
            }));
        }

        tokio::task::yield_now().await;
        assert!(order.lock().unwrap().is_empty());

        drop(guard);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn dropped_ticket_releases_its_slot() {
        let lock = OrderedMutex::new();
        let guard = lock.acquire().await;
        let abandoned = lock.enqueue();
        let third = lock.enqueue();
        drop(abandoned);
        drop(guard);
        let _guard = third.wait().await;
    }

    #[tokio::test]
    async fn dropped_ready_ticket_does_not_leak_the_lock() {
        let lock = OrderedMutex::new();
        let ready = lock.enqueue();
        drop(ready);
        let _guard = lock.acquire().await;
    }

    #[tokio::test]
    async fn cancellation_reaches_existing_tokens_only() {
        let (_global_tx, global_rx) = watch::channel(false);
        let source = CancellationSource::new(global_rx.clone());
        let token = source.token();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());

        let fresh = CancellationSource::new(global_rx);
        assert!(!fresh.token().is_cancelled());
    }

    #[tokio::test]
    async fn global_cancellation_reaches_channel_tokens() {
        let (global_tx, global_rx) = watch::channel(false);
        let source = CancellationSource::new(global_rx);
        let token = source.token();
        global_tx.send(true).unwrap();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn with_cancel_prefers_completed_work() {
        let (_global_tx, global_rx) = watch::channel(false);
        let source = CancellationSource::new(global_rx);
        let token = source.token();

        let hits = AtomicUsize::new(0);
        let value = with_cancel(&token, async {
            hits.fetch_add(1, Ordering::SeqCst);
            7
        })
        .await
        .unwrap();
        assert_eq!(value, 7);

        source.cancel();
        let result = with_cancel(&token, std::future::pending::<()>()).await;
        assert!(matches!(result, Err(ExecutionError::Cancelled)));
    }
}
