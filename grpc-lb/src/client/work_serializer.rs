/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! A serialized executor which owns the state its callbacks operate on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::LbError;
use crate::rt::Runtime;

type Work<S> = Box<dyn FnOnce(&mut S) + Send>;

enum WorkItem<S> {
    Work(Work<S>),
    Shutdown,
}

struct Inner<S> {
    name: &'static str,
    tx: mpsc::UnboundedSender<WorkItem<S>>,
    closed: AtomicBool,
}

/// Runs callbacks one at a time, in submission order, against a state value
/// of type `S`.
///
/// Callbacks never run on the thread that scheduled them: a task spawned on
/// the injected [`Runtime`] drains the queue. Because only that task touches
/// the state, callbacks get `&mut S` without any locking.
///
/// Handles are cheap to clone. Callbacks that need to schedule further work
/// should capture a [`WeakWorkSerializer`] so the state does not keep its own
/// queue alive.
pub struct WorkSerializer<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for WorkSerializer<S> {
    fn clone(&self) -> Self {
        WorkSerializer {
            inner: self.inner.clone(),
        }
    }
}

/// A non-owning handle to a [`WorkSerializer`].
pub struct WeakWorkSerializer<S> {
    inner: Weak<Inner<S>>,
}

impl<S> Clone for WeakWorkSerializer<S> {
    fn clone(&self) -> Self {
        WeakWorkSerializer {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Send + 'static> WorkSerializer<S> {
    /// Creates a serializer owning `state` and starts draining its queue.
    pub fn new(name: &'static str, state: S, runtime: &dyn Runtime) -> Self {
        Self::new_cyclic(name, runtime, |_| state)
    }

    /// Like [`WorkSerializer::new`], but builds the state from a closure that
    /// receives the serializer, so the state can hold a handle to it.
    pub fn new_cyclic(
        name: &'static str,
        runtime: &dyn Runtime,
        build: impl FnOnce(&WorkSerializer<S>) -> S,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkItem<S>>();
        let serializer = WorkSerializer {
            inner: Arc::new(Inner {
                name,
                tx,
                closed: AtomicBool::new(false),
            }),
        };
        let mut state = build(&serializer);
        // The drain task only ends once shutdown was requested or every
        // handle is gone.
        let _handle = runtime.spawn(Box::pin(async move {
            trace!(serializer = name, "work serializer started");
            while let Some(item) = rx.recv().await {
                match item {
                    WorkItem::Work(work) => work(&mut state),
                    WorkItem::Shutdown => break,
                }
            }
            rx.close();
            // Callbacks that raced with shutdown are dropped unrun.
            while rx.try_recv().is_ok() {}
            drop(state);
            trace!(serializer = name, "work serializer stopped");
        }));
        serializer
    }

    /// Enqueues `work` and returns immediately.
    pub fn schedule(&self, work: impl FnOnce(&mut S) + Send + 'static) -> Result<(), LbError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LbError::SerializerClosed);
        }
        self.inner
            .tx
            .send(WorkItem::Work(Box::new(work)))
            .map_err(|_| LbError::SerializerClosed)
    }

    /// Schedules `work` and resolves with its return value once it ran.
    ///
    /// Must not be awaited from inside a callback of the same serializer.
    pub async fn run<R: Send + 'static>(
        &self,
        work: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, LbError> {
        let (tx, rx) = oneshot::channel();
        self.schedule(move |state| {
            let _ = tx.send(work(state));
        })?;
        rx.await.map_err(|_| LbError::SerializerClosed)
    }

    /// Stops accepting work. Callbacks queued before this call still run,
    /// then the state is dropped. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(serializer = self.inner.name, "work serializer shutting down");
        let _ = self.inner.tx.send(WorkItem::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn downgrade(&self) -> WeakWorkSerializer<S> {
        WeakWorkSerializer {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<S: Send + 'static> WeakWorkSerializer<S> {
    pub fn upgrade(&self) -> Option<WorkSerializer<S>> {
        self.inner.upgrade().map(|inner| WorkSerializer { inner })
    }

    /// Schedules `work` if the serializer is still alive.
    pub fn schedule(&self, work: impl FnOnce(&mut S) + Send + 'static) -> Result<(), LbError> {
        match self.upgrade() {
            Some(serializer) => serializer.schedule(work),
            None => Err(LbError::SerializerClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::rt::TokioRuntime;

    #[tokio::test]
    async fn test_callbacks_run_in_submission_order() {
        let serializer = WorkSerializer::new("test", Vec::new(), &TokioRuntime::default());
        for i in 0..100 {
            serializer.schedule(move |v: &mut Vec<i32>| v.push(i)).unwrap();
        }
        let got = serializer.run(|v| v.clone()).await.unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callbacks_run_off_submitting_thread() {
        let serializer = WorkSerializer::new("test", (), &TokioRuntime::default());
        let submitter = thread::current().id();
        let ran_on = serializer.run(|_| thread::current().id()).await.unwrap();
        assert_ne!(ran_on, submitter);
    }

    #[tokio::test]
    async fn test_schedule_returns_before_work_runs() {
        let serializer = WorkSerializer::new("test", 0, &TokioRuntime::default());
        let (tx, rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();
        serializer
            .schedule(move |n: &mut i32| {
                *n += 1;
                let _ = tx.send(());
            })
            .unwrap();
        serializer
            .schedule(move |n: &mut i32| {
                let _ = done_tx.send(*n);
            })
            .unwrap();
        rx.await.unwrap();
        assert_eq!(done_rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work_then_rejects() {
        let serializer = WorkSerializer::new("test", 0, &TokioRuntime::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..10 {
            let tx = tx.clone();
            serializer
                .schedule(move |n: &mut i32| {
                    *n += 1;
                    let _ = tx.send((i, *n));
                })
                .unwrap();
        }
        serializer.shutdown();
        serializer.shutdown();
        assert!(serializer.is_closed());
        assert_eq!(
            serializer.schedule(|_| panic!("must not run")),
            Err(LbError::SerializerClosed)
        );
        assert_eq!(serializer.run(|n| *n).await, Err(LbError::SerializerClosed));
        for i in 0..10 {
            assert_eq!(rx.recv().await, Some((i, i + 1)));
        }
    }

    #[tokio::test]
    async fn test_state_dropped_after_shutdown() {
        struct DropSignal(Option<oneshot::Sender<()>>);
        impl Drop for DropSignal {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }
        let (tx, rx) = oneshot::channel();
        let serializer =
            WorkSerializer::new("test", DropSignal(Some(tx)), &TokioRuntime::default());
        serializer.shutdown();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("state was not dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cyclic_state_can_schedule_follow_up_work() {
        struct State {
            me: WeakWorkSerializer<State>,
            log: Vec<&'static str>,
        }
        let serializer = WorkSerializer::new_cyclic("test", &TokioRuntime::default(), |s| State {
            me: s.downgrade(),
            log: Vec::new(),
        });
        serializer
            .schedule(|st: &mut State| {
                st.log.push("first");
                st.me
                    .schedule(|st: &mut State| st.log.push("follow-up"))
                    .unwrap();
            })
            .unwrap();
        serializer.schedule(|st| st.log.push("second")).unwrap();
        // The follow-up is queued behind everything submitted so far.
        let log = serializer.run(|st| st.log.clone()).await.unwrap();
        assert_eq!(log, vec!["first", "second"]);
        let log = serializer.run(|st| st.log.clone()).await.unwrap();
        assert_eq!(log, vec!["first", "second", "follow-up"]);
    }
}
