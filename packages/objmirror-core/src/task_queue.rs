//! Per-object FIFO of asynchronous tasks.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{FutureExt, LocalBoxFuture, Shared};

use crate::error::Result;

type Turnstile = Shared<LocalBoxFuture<'static, ()>>;

/// Runs tasks one at a time in enqueue order. Each task waits for the one queued before it
/// to settle, whatever its outcome, so a failure never stalls the queue.
#[derive(Default)]
pub struct TaskQueue {
    tail: RefCell<Option<Turnstile>>,
    pending: Rc<Cell<usize>>,
}

impl TaskQueue {
    /// Queue `task`. Its place in line is taken when `enqueue` is called, not when the returned
    /// future is first polled; dropping the returned future releases the slot.
    pub fn enqueue<F, Fut, T>(&self, task: F) -> LocalBoxFuture<'static, Result<T>>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let next: LocalBoxFuture<'static, ()> = done_rx.map(|_| ()).boxed_local();
        let previous = self.tail.replace(Some(next.shared()));

        self.pending.set(self.pending.get() + 1);
        let turn = Turn {
            pending: self.pending.clone(),
            done: Some(done_tx),
        };

        async move {
            let _turn = turn;
            if let Some(previous) = previous {
                previous.await;
            }
            task().await
        }
        .boxed_local()
    }

    /// Number of tasks queued or running.
    pub fn len(&self) -> usize {
        self.pending.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.pending.get())
            .finish()
    }
}

/// Marks a task's slot as settled when dropped.
struct Turn {
    pending: Rc<Cell<usize>>,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.pending.set(self.pending.get().saturating_sub(1));
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
