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

//! Tracking of a connectivity state and fan-out to registered watchers.

use std::cell::RefCell;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::ReentrantMutex;
use tracing::{debug, error, trace};

use crate::client::ConnectivityState;
use crate::status::Status;

/// Checks that `status` is consistent with `state`: TransientFailure requires
/// a non-OK status and every other state requires OK.
pub fn validate_state_status(state: ConnectivityState, status: &Status) -> Result<(), String> {
    match (state, status.is_ok()) {
        (ConnectivityState::TransientFailure, true) => {
            Err("TransientFailure must carry a non-OK status".to_string())
        }
        (ConnectivityState::TransientFailure, false) | (_, true) => Ok(()),
        (state, false) => Err(format!("{state} must carry an OK status, got {status}")),
    }
}

/// Receives connectivity state changes from a [`ConnectivityStateTracker`].
///
/// Notifications are delivered while the tracker's lock is held.
/// Implementations must not block; they typically enqueue the change onto
/// their own serializer.
pub trait ConnectivityStateWatcher: Send + Sync {
    fn on_state_change(&self, state: ConnectivityState, status: &Status);
}

impl<F> ConnectivityStateWatcher for F
where
    F: Fn(ConnectivityState, &Status) + Send + Sync,
{
    fn on_state_change(&self, state: ConnectivityState, status: &Status) {
        self(state, status)
    }
}

/// Identifies a watcher registration. Unique across all trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

impl WatcherId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        WatcherId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for WatcherId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TrackerState {
    state: ConnectivityState,
    status: Status,
    watchers: Vec<(WatcherId, Arc<dyn ConnectivityStateWatcher>)>,
}

impl TrackerState {
    fn is_registered(&self, id: WatcherId) -> bool {
        self.watchers.iter().any(|(w, _)| *w == id)
    }
}

/// Holds the current connectivity state of an entity (a subchannel or a
/// channel) together with its status, and notifies watchers of changes.
///
/// All operations are serialized by an internal lock and watchers are
/// notified in registration order, so two successive states are always
/// observed in the order they were set. The lock is reentrant: a watcher may
/// add or remove watchers from within its callback.
pub struct ConnectivityStateTracker {
    name: String,
    inner: ReentrantMutex<RefCell<TrackerState>>,
}

impl ConnectivityStateTracker {
    pub fn new(name: impl Into<String>, state: ConnectivityState, status: Status) -> Self {
        ConnectivityStateTracker {
            name: name.into(),
            inner: ReentrantMutex::new(RefCell::new(TrackerState {
                state,
                status,
                watchers: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().borrow().state
    }

    pub fn status(&self) -> Status {
        self.inner.lock().borrow().status.clone()
    }

    /// Records a new state and notifies every registered watcher.
    ///
    /// If `state` equals the current state only the status is updated and no
    /// notification is sent. A status which does not match the state is
    /// rejected. Once the tracker reaches Shutdown all registrations are
    /// dropped and further updates are ignored.
    pub fn set_state(&self, state: ConnectivityState, status: Status, reason: &str) {
        if let Err(e) = validate_state_status(state, &status) {
            error!(tracker = %self.name, %state, %status, reason, "invalid state update: {e}");
            debug_assert!(false, "invalid state update for {}: {e}", self.name);
            return;
        }
        let guard = self.inner.lock();
        let watchers = {
            let mut inner = guard.borrow_mut();
            if inner.state == ConnectivityState::Shutdown {
                trace!(tracker = %self.name, %state, "ignoring update after shutdown");
                return;
            }
            if inner.state == state {
                inner.status = status;
                return;
            }
            debug!(
                tracker = %self.name,
                from = %inner.state,
                to = %state,
                %status,
                reason,
                "connectivity state changed"
            );
            inner.state = state;
            inner.status = status.clone();
            inner.watchers.clone()
        };
        for (id, watcher) in watchers {
            // A callback earlier in this loop may have removed it.
            if guard.borrow().is_registered(id) {
                watcher.on_state_change(state, &status);
            }
        }
        if state == ConnectivityState::Shutdown {
            guard.borrow_mut().watchers.clear();
        }
    }

    /// Registers `watcher` and immediately notifies it of the current state.
    pub fn add_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>) -> WatcherId {
        let id = WatcherId::next();
        let guard = self.inner.lock();
        let (state, status) = {
            let mut inner = guard.borrow_mut();
            if inner.state != ConnectivityState::Shutdown {
                inner.watchers.push((id, watcher.clone()));
            }
            (inner.state, inner.status.clone())
        };
        trace!(tracker = %self.name, watcher = %id, %state, "watcher added");
        watcher.on_state_change(state, &status);
        id
    }

    /// Unregisters a watcher. Returns false if it was not registered.
    ///
    /// Once this returns the watcher receives no further notifications.
    pub fn remove_watcher(&self, id: WatcherId) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let before = inner.watchers.len();
        inner.watchers.retain(|(w, _)| *w != id);
        let removed = inner.watchers.len() != before;
        if removed {
            trace!(tracker = %self.name, watcher = %id, "watcher removed");
        }
        removed
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.lock().borrow().watchers.len()
    }
}
