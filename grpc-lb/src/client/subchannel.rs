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

//! Subchannels: logical connections to a single backend address.
//!
//! The channel keeps one [`InternalSubchannel`] per [`SubchannelKey`] in a
//! [`SubchannelPool`] and hands each policy its own [`ExternalSubchannel`]
//! wrapper. Connectivity changes reach the policy as [`SubchannelEvent`]s
//! delivered through a [`SubchannelEventSink`], which the channel points at
//! its work serializer.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::client::ConnectivityState;
use crate::client::backoff::{BackoffConfig, ExponentialBackoff};
use crate::client::channel_args::ChannelArgs;
use crate::client::connectivity_state::{ConnectivityStateTracker, WatcherId};
use crate::client::name_resolution::Address;
use crate::client::transport::Transport;
use crate::rt::{BoxedTaskHandle, Runtime};
use crate::status::Status;

/// Represents the current state of a Subchannel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See Subchannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    /// Non-OK exactly when `connectivity_state` is TransientFailure, in which
    /// case it describes the most recent connection error.
    pub status: Status,
}

impl SubchannelState {
    pub fn new(connectivity_state: ConnectivityState, status: Status) -> Self {
        SubchannelState {
            connectivity_state,
            status,
        }
    }

    pub fn idle() -> Self {
        Self::new(ConnectivityState::Idle, Status::ok())
    }

    pub fn connecting() -> Self {
        Self::new(ConnectivityState::Connecting, Status::ok())
    }

    pub fn ready() -> Self {
        Self::new(ConnectivityState::Ready, Status::ok())
    }

    pub fn transient_failure(status: Status) -> Self {
        Self::new(ConnectivityState::TransientFailure, status)
    }

    /// The most recent connection error, if the subchannel is failing.
    pub fn last_connection_error(&self) -> Option<&Status> {
        (self.connectivity_state == ConnectivityState::TransientFailure).then_some(&self.status)
    }
}

impl Default for SubchannelState {
    fn default() -> Self {
        Self::idle()
    }
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.last_connection_error() {
            Some(status) => write!(f, "{} ({status})", self.connectivity_state),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

/// A Subchannel represents a method of communicating with a server which may be
/// connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when request_connection() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to IDLE when the reconnect backoff timer
///   has expired.  This timer scales exponentially and is reset when the
///   subchannel becomes READY.
///
/// Subchannels are shared through `Arc`. When the last reference is dropped
/// the subchannel is disconnected and no further state updates are delivered
/// for it.
pub trait Subchannel: Send + Sync {
    /// The address this subchannel connects to.
    fn address(&self) -> &Address;

    /// The arguments this subchannel was created with.
    fn args(&self) -> &ChannelArgs;

    /// Starts watching connectivity state changes. The first event delivered
    /// for the watch carries the current state.
    fn watch_connectivity_state(&self) -> WatchHandle;

    /// Stops a watch. Idempotent, and a no-op for handles this subchannel did
    /// not issue. No event for the watch is processed after this returns,
    /// even one that was already queued.
    fn cancel_connectivity_state_watch(&self, handle: &WatchHandle);

    /// Starts connecting if the subchannel is Idle. Otherwise does nothing.
    fn request_connection(&self);

    /// Resets the connection backoff. A subchannel waiting out a backoff
    /// delay moves to Idle immediately.
    fn reset_backoff(&self);
}

impl Debug for dyn Subchannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({})", self.address())
    }
}

impl Display for dyn Subchannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// Reports whether two handles refer to the same subchannel.
pub fn same_subchannel(a: &Arc<dyn Subchannel>, b: &Arc<dyn Subchannel>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Identifies one connectivity watch on a subchannel.
#[derive(Debug)]
pub struct WatchHandle {
    id: WatcherId,
    active: Arc<AtomicBool>,
}

impl WatchHandle {
    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// A connectivity change of a watched subchannel, tagged with its watch.
pub struct SubchannelEvent {
    pub subchannel: Arc<dyn Subchannel>,
    pub state: SubchannelState,
    active: Arc<AtomicBool>,
}

impl SubchannelEvent {
    /// False once the watch that produced this event was cancelled. Inactive
    /// events must be discarded.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Debug for SubchannelEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubchannelEvent")
            .field("subchannel", &self.subchannel.address())
            .field("state", &self.state)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Receives subchannel events. Implementations must only enqueue the event;
/// they are invoked while the subchannel's state lock is held.
pub type SubchannelEventSink = Arc<dyn Fn(SubchannelEvent) + Send + Sync>;

/// Registers a watch on `tracker` which forwards every change of `subchannel`
/// to `sink`.
pub(crate) fn watch_tracker(
    tracker: &ConnectivityStateTracker,
    subchannel: Weak<dyn Subchannel>,
    sink: SubchannelEventSink,
) -> WatchHandle {
    let active = Arc::new(AtomicBool::new(true));
    let flag = active.clone();
    let id = tracker.add_watcher(Arc::new(
        move |state: ConnectivityState, status: &Status| {
            if !flag.load(Ordering::Acquire) {
                return;
            }
            if let Some(subchannel) = subchannel.upgrade() {
                sink(SubchannelEvent {
                    subchannel,
                    state: SubchannelState::new(state, status.clone()),
                    active: flag.clone(),
                });
            }
        },
    ));
    WatchHandle { id, active }
}

/// Cancels a watch created by [`watch_tracker`]. Returns false if `handle`
/// was not registered on `tracker`.
pub(crate) fn cancel_tracker_watch(tracker: &ConnectivityStateTracker, handle: &WatchHandle) -> bool {
    if tracker.remove_watcher(handle.id) {
        handle.active.store(false, Ordering::Release);
        true
    } else {
        false
    }
}

/// SubchannelKey uniquely identifies a subchannel in the pool.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubchannelKey {
    pub address: Address,
    pub args: ChannelArgs,
}

impl SubchannelKey {
    pub fn new(address: Address, args: ChannelArgs) -> Self {
        Self { address, args }
    }
}

impl Display for SubchannelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} {}", self.address, self.args)
        }
    }
}

impl Debug for SubchannelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Connection settings shared by all subchannels of a channel.
#[derive(Debug, Clone)]
pub(crate) struct ConnectConfig {
    pub backoff: BackoffConfig,
    pub min_connect_timeout: Duration,
}

enum SubchannelStateMachineEvent {
    ConnectionRequested,
    ConnectionSucceeded(oneshot::Receiver<Result<(), String>>),
    ConnectionTimedOut,
    ConnectionFailed(String),
    ConnectionTerminated,
    // Carries the backoff attempt it ends.
    BackoffExpired(u64),
    ResetBackoff,
}

impl Debug for SubchannelStateMachineEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRequested => write!(f, "ConnectionRequested"),
            Self::ConnectionSucceeded(_) => write!(f, "ConnectionSucceeded"),
            Self::ConnectionTimedOut => write!(f, "ConnectionTimedOut"),
            Self::ConnectionFailed(e) => write!(f, "ConnectionFailed({e})"),
            Self::ConnectionTerminated => write!(f, "ConnectionTerminated"),
            Self::BackoffExpired(attempt) => write!(f, "BackoffExpired({attempt})"),
            Self::ResetBackoff => write!(f, "ResetBackoff"),
        }
    }
}

struct InnerSubchannel {
    backoff: ExponentialBackoff,
    // Numbers the entries into TransientFailure.
    backoff_attempt: u64,
    // The connect, disconnect or backoff task of the current state.
    task: Option<BoxedTaskHandle>,
}

impl InnerSubchannel {
    fn replace_task(&mut self, task: Option<BoxedTaskHandle>) {
        if let Some(old) = std::mem::replace(&mut self.task, task) {
            old.abort();
        }
    }
}

/// The pooled connection to one backend, shared by every policy referring to
/// the same key.
///
/// State transitions are driven by a task reading
/// `SubchannelStateMachineEvent`s. That task only holds a weak reference, so
/// dropping the last `Arc` stops it.
pub(crate) struct InternalSubchannel {
    key: SubchannelKey,
    tracker: ConnectivityStateTracker,
    state_machine_event_sender: mpsc::UnboundedSender<SubchannelStateMachineEvent>,
    inner: Mutex<InnerSubchannel>,
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn Runtime>,
    min_connect_timeout: Duration,
    pool: Weak<SubchannelPool>,
}

impl InternalSubchannel {
    pub(crate) fn new(
        key: SubchannelKey,
        transport: Arc<dyn Transport>,
        runtime: Arc<dyn Runtime>,
        config: &ConnectConfig,
        pool: Weak<SubchannelPool>,
    ) -> Arc<InternalSubchannel> {
        debug!(subchannel = %key, "creating internal subchannel");
        let backoff = ExponentialBackoff::new(config.backoff.clone()).unwrap_or_else(|e| {
            warn!(subchannel = %key, "invalid backoff config ({e}), using defaults");
            ExponentialBackoff::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<SubchannelStateMachineEvent>();
        let isc = Arc::new(Self {
            tracker: ConnectivityStateTracker::new(
                key.to_string(),
                ConnectivityState::Idle,
                Status::ok(),
            ),
            key,
            state_machine_event_sender: tx,
            inner: Mutex::new(InnerSubchannel {
                backoff,
                backoff_attempt: 0,
                task: None,
            }),
            transport,
            runtime: runtime.clone(),
            min_connect_timeout: config.min_connect_timeout,
            pool,
        });

        let weak = Arc::downgrade(&isc);
        let key = isc.key.clone();
        let _handle = runtime.spawn(Box::pin(async move {
            while let Some(event) = rx.recv().await {
                let Some(isc) = weak.upgrade() else {
                    break;
                };
                trace!(subchannel = %key, ?event, "state machine event");
                isc.handle_event(event);
            }
            trace!(subchannel = %key, "subchannel state machine exited");
        }));
        isc
    }

    pub(crate) fn key(&self) -> &SubchannelKey {
        &self.key
    }

    pub(crate) fn tracker(&self) -> &ConnectivityStateTracker {
        &self.tracker
    }

    pub(crate) fn request_connection(&self) {
        let _ = self
            .state_machine_event_sender
            .send(SubchannelStateMachineEvent::ConnectionRequested);
    }

    pub(crate) fn reset_backoff(&self) {
        let _ = self
            .state_machine_event_sender
            .send(SubchannelStateMachineEvent::ResetBackoff);
    }

    fn handle_event(&self, event: SubchannelStateMachineEvent) {
        use ConnectivityState as S;
        use SubchannelStateMachineEvent as E;
        match (self.tracker.state(), event) {
            (S::Idle, E::ConnectionRequested) => self.move_to_connecting(),
            (S::Connecting, E::ConnectionSucceeded(listener)) => self.move_to_ready(listener),
            (S::Connecting, E::ConnectionTimedOut) => {
                self.move_to_transient_failure("connect timeout expired".to_string())
            }
            (S::Connecting, E::ConnectionFailed(err)) => self.move_to_transient_failure(err),
            (S::Ready, E::ConnectionTerminated) => self.move_to_idle("connection closed"),
            (S::TransientFailure, E::BackoffExpired(attempt))
                if attempt == self.inner.lock().backoff_attempt =>
            {
                self.move_to_idle("backoff expired")
            }
            (S::TransientFailure, E::ResetBackoff) => {
                self.inner.lock().backoff.reset();
                self.move_to_idle("backoff reset");
            }
            (_, E::ResetBackoff) => self.inner.lock().backoff.reset(),
            (state, event) => {
                trace!(subchannel = %self.key, %state, ?event, "ignoring stale event");
            }
        }
    }

    fn move_to_idle(&self, reason: &str) {
        self.inner.lock().replace_task(None);
        self.tracker
            .set_state(ConnectivityState::Idle, Status::ok(), reason);
    }

    fn move_to_connecting(&self) {
        self.tracker
            .set_state(ConnectivityState::Connecting, Status::ok(), "connection requested");

        let min_connect_timeout = self.min_connect_timeout;
        let transport = self.transport.clone();
        let address = self.key.address.clone();
        let args = self.key.args.clone();
        let state_machine_tx = self.state_machine_event_sender.clone();
        let runtime = self.runtime.clone();
        let connect_task = self.runtime.spawn(Box::pin(async move {
            tokio::select! {
                _ = runtime.sleep(min_connect_timeout) => {
                    let _ = state_machine_tx.send(SubchannelStateMachineEvent::ConnectionTimedOut);
                }
                result = transport.connect(&address, &args) => {
                    let event = match result {
                        Ok(t) => SubchannelStateMachineEvent::ConnectionSucceeded(t.disconnection_listener),
                        Err(e) => SubchannelStateMachineEvent::ConnectionFailed(e),
                    };
                    let _ = state_machine_tx.send(event);
                },
            }
        }));
        self.inner.lock().replace_task(Some(connect_task));
    }

    fn move_to_ready(&self, closed_rx: oneshot::Receiver<Result<(), String>>) {
        {
            let mut inner = self.inner.lock();
            inner.backoff.reset();
            inner.replace_task(None);
        }
        self.tracker
            .set_state(ConnectivityState::Ready, Status::ok(), "connection established");

        let state_machine_tx = self.state_machine_event_sender.clone();
        let key = self.key.clone();
        let task = self.runtime.spawn(Box::pin(async move {
            match closed_rx.await {
                Ok(Err(e)) => warn!(subchannel = %key, "transport closed with error: {e}"),
                Ok(Ok(())) | Err(_) => debug!(subchannel = %key, "transport closed"),
            }
            let _ = state_machine_tx.send(SubchannelStateMachineEvent::ConnectionTerminated);
        }));
        self.inner.lock().replace_task(Some(task));
    }

    fn move_to_transient_failure(&self, err: String) {
        let (delay, attempt) = {
            let mut inner = self.inner.lock();
            inner.backoff_attempt += 1;
            (inner.backoff.backoff_duration(), inner.backoff_attempt)
        };
        debug!(subchannel = %self.key, error = %err, ?delay, "connection attempt failed");
        self.tracker.set_state(
            ConnectivityState::TransientFailure,
            Status::unavailable(err),
            "connection attempt failed",
        );

        let state_machine_tx = self.state_machine_event_sender.clone();
        let runtime = self.runtime.clone();
        let backoff_task = self.runtime.spawn(Box::pin(async move {
            runtime.sleep(delay).await;
            let _ = state_machine_tx.send(SubchannelStateMachineEvent::BackoffExpired(attempt));
        }));
        self.inner.lock().replace_task(Some(backoff_task));
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        debug!(subchannel = %self.key, "dropping internal subchannel");
        self.inner.get_mut().replace_task(None);
        if let Some(pool) = self.pool.upgrade() {
            pool.unregister_subchannel(&self.key);
        }
    }
}

/// The channel's set of live subchannels, keyed by [`SubchannelKey`].
///
/// Entries are weak: a subchannel lives as long as some policy or picker
/// holds it, and unregisters itself when dropped.
pub(crate) struct SubchannelPool {
    subchannels: Mutex<BTreeMap<SubchannelKey, Weak<InternalSubchannel>>>,
}

impl SubchannelPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            subchannels: Mutex::new(BTreeMap::new()),
        })
    }

    /// Returns the live subchannel for `key`, creating it with `create` if
    /// there is none.
    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        key: SubchannelKey,
        create: impl FnOnce(SubchannelKey, Weak<SubchannelPool>) -> Arc<InternalSubchannel>,
    ) -> Arc<InternalSubchannel> {
        let mut subchannels = self.subchannels.lock();
        if let Some(isc) = subchannels.get(&key).and_then(Weak::upgrade) {
            trace!(subchannel = %key, "reusing pooled subchannel");
            return isc;
        }
        let isc = create(key.clone(), Arc::downgrade(self));
        subchannels.insert(key, Arc::downgrade(&isc));
        isc
    }

    fn unregister_subchannel(&self, key: &SubchannelKey) {
        let mut subchannels = self.subchannels.lock();
        // A new subchannel may already have taken over the key.
        if subchannels
            .get(key)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            trace!(subchannel = %key, "removing subchannel from the pool");
            subchannels.remove(key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subchannels.lock().len()
    }
}

/// The handle a policy receives from `create_subchannel`: a reference to a
/// pooled subchannel plus the sink its watches report to.
pub(crate) struct ExternalSubchannel {
    isc: Arc<InternalSubchannel>,
    sink: SubchannelEventSink,
    me: Weak<ExternalSubchannel>,
    watches: Mutex<Vec<WatcherId>>,
}

impl ExternalSubchannel {
    pub(crate) fn new(isc: Arc<InternalSubchannel>, sink: SubchannelEventSink) -> Arc<Self> {
        Arc::new_cyclic(|me| ExternalSubchannel {
            isc,
            sink,
            me: me.clone(),
            watches: Mutex::new(Vec::new()),
        })
    }
}

impl Subchannel for ExternalSubchannel {
    fn address(&self) -> &Address {
        &self.isc.key().address
    }

    fn args(&self) -> &ChannelArgs {
        &self.isc.key().args
    }

    fn watch_connectivity_state(&self) -> WatchHandle {
        let me: Weak<dyn Subchannel> = self.me.clone();
        let handle = watch_tracker(self.isc.tracker(), me, self.sink.clone());
        self.watches.lock().push(handle.id());
        handle
    }

    fn cancel_connectivity_state_watch(&self, handle: &WatchHandle) {
        if cancel_tracker_watch(self.isc.tracker(), handle) {
            self.watches.lock().retain(|id| *id != handle.id());
        }
    }

    fn request_connection(&self) {
        self.isc.request_connection();
    }

    fn reset_backoff(&self) {
        self.isc.reset_backoff();
    }
}

impl Drop for ExternalSubchannel {
    fn drop(&mut self) {
        for id in self.watches.get_mut().drain(..) {
            self.isc.tracker().remove_watcher(id);
        }
    }
}
