//! Background event loop.
//!
//! A single dedicated thread serializes every call into the streamers and
//! the underlying native libraries, so no two native operations overlap.
//! Tasks are posted fire-and-forget, deferred, or called with a result
//! round trip that propagates panics back to the caller as typed failures.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::mpsc,
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use crate::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Msg {
    Run(Task),
    RunAt(Instant, Task),
    Shutdown,
}

struct Deferred {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

/// Handle to the event loop thread.
///
/// Dropping the handle shuts the loop down after the queued tasks ran.
pub struct EventLoop {
    tx: mpsc::Sender<Msg>,
    thread_id: ThreadId,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EventLoop").field("thread_id", &self.thread_id).finish()
    }
}

impl EventLoop {
    /// Starts the event loop thread and waits until it is ready.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("capture-event-loop".to_string())
            .spawn(move || {
                let _ = ready_tx.send(thread::current().id());
                Self::run(rx);
            })
            .expect("cannot spawn event loop thread");

        let thread_id = ready_rx.recv().expect("event loop thread did not start");
        Self { tx, thread_id, thread: Some(thread) }
    }

    fn execute(task: Task) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("event loop task panicked");
        }
    }

    fn run(rx: mpsc::Receiver<Msg>) {
        let mut deferred: BinaryHeap<Deferred> = BinaryHeap::new();
        let mut seq = 0;

        loop {
            let next_at = deferred.peek().map(|next| next.at);
            let msg = match next_at {
                Some(at) => {
                    let now = Instant::now();
                    if at <= now {
                        let task = deferred.pop().unwrap().task;
                        Self::execute(task);
                        continue;
                    }
                    match rx.recv_timeout(at - now) {
                        Ok(msg) => msg,
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => return,
                },
            };

            match msg {
                Msg::Run(task) => Self::execute(task),
                Msg::RunAt(at, task) => {
                    deferred.push(Deferred { at, seq, task });
                    seq += 1;
                }
                Msg::Shutdown => return,
            }
        }
    }

    /// Whether the caller is currently on the event loop thread.
    pub fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Posts a fire-and-forget task.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Msg::Run(Box::new(task)));
    }

    /// Posts a task to run after `delay`.
    pub fn post_delayed(&self, task: impl FnOnce() + Send + 'static, delay: Duration) {
        let _ = self.tx.send(Msg::RunAt(Instant::now() + delay, Box::new(task)));
    }

    /// Runs a task on the loop thread and awaits its result.
    ///
    /// A panic inside the task is caught on the loop thread and surfaced as
    /// [`Error::TaskPanicked`]. Calling from the loop thread itself would
    /// deadlock and is rejected.
    pub async fn call<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let rx = self.dispatch(task)?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(())) => Err(Error::TaskPanicked),
            Err(_) => Err(Error::EventLoopTerminated),
        }
    }

    /// Blocking variant of [`call`](Self::call) for non-async callers.
    pub fn call_blocking<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let rx = self.dispatch(task)?;
        match rx.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(())) => Err(Error::TaskPanicked),
            Err(_) => Err(Error::EventLoopTerminated),
        }
    }

    fn dispatch<T, F>(&self, task: F) -> Result<oneshot::Receiver<std::result::Result<T, ()>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.on_loop_thread() {
            return Err(Error::WouldDeadlock);
        }

        let (tx, rx) = oneshot::channel();
        let job = move || {
            let result = catch_unwind(AssertUnwindSafe(task)).map_err(|_| ());
            let _ = tx.send(result);
        };
        self.tx.send(Msg::Run(Box::new(job))).map_err(|_| Error::EventLoopTerminated)?;
        Ok(rx)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn call_returns_value() {
        let el = EventLoop::new();
        let value = el.call(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn call_propagates_panic() {
        let el = EventLoop::new();
        let res: Result<()> = el.call(|| panic!("boom")).await;
        assert!(matches!(res, Err(Error::TaskPanicked)));
        // the loop survives a panicking task
        assert_eq!(el.call(|| 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tasks_run_in_post_order() {
        let el = EventLoop::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = order.clone();
            el.post(move || order.lock().unwrap().push(i));
        }
        el.call(|| ()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn delayed_task_runs_after_delay() {
        let el = EventLoop::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let started = Instant::now();
        el.post_delayed(move || { r.fetch_add(1, Ordering::SeqCst); }, Duration::from_millis(200));
        el.call(|| ()).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        el.call(|| ()).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn call_from_loop_thread_is_rejected() {
        let el = Arc::new(EventLoop::new());
        let inner = el.clone();
        let rejected = el
            .call(move || matches!(inner.call_blocking(|| ()), Err(Error::WouldDeadlock)))
            .await
            .unwrap();
        assert!(rejected);
    }
}
