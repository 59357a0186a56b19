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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;
use tonic::metadata::MetadataMap;
use tracing::{debug, error, info, trace, warn};

use crate::client::backoff::{BackoffConfig, duration_secs};
use crate::client::channel_args::ChannelArgs;
use crate::client::connectivity_state::{
    ConnectivityStateTracker, ConnectivityStateWatcher, WatcherId,
};
use crate::client::load_balancing::{
    CallState, ChannelControlHelper, DropPicker, LbPolicyOptions, LbPolicyRegistry,
    ManagedPolicy, Pick, PickArgs, PickResult, QueuingPicker, StateUpdate, Subchannel,
    SubchannelEvent, TraceSeverity, WorkScheduler,
};
use crate::client::name_resolution::{
    Address, EndpointAddress, ResolutionRequester, UpdateArgs,
};
use crate::client::service_config::LbConfig;
use crate::client::subchannel::{
    ConnectConfig, ExternalSubchannel, InternalSubchannel, SubchannelEventSink, SubchannelKey,
    SubchannelPool,
};
use crate::client::transport::Transport;
use crate::client::work_serializer::{WeakWorkSerializer, WorkSerializer};
use crate::client::{CallOptions, ConnectivityState};
use crate::error::LbError;
use crate::rt::{BoxedTaskHandle, Runtime};
use crate::status::Status;

/// Settings of an [`LbChannel`].
///
/// Deserializes from camelCase JSON with durations in (fractional) seconds.
/// Missing fields take their default values.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[non_exhaustive]
pub struct ChannelOptions {
    /// The authority of the target, handed to LB policies.
    pub authority: String,
    /// The policy used until the resolver supplies a load balancing config.
    pub default_lb_policy: String,
    /// Backoff between connection attempts of a subchannel.
    pub connect_backoff: BackoffConfig,
    /// Lower bound for the deadline of a single connection attempt.
    #[serde(deserialize_with = "duration_secs")]
    pub min_connect_timeout: Duration,
    /// Minimum time between two re-resolution requests reaching the resolver.
    #[serde(deserialize_with = "duration_secs")]
    pub min_reresolution_interval: Duration,
}

impl ChannelOptions {
    pub fn new(authority: impl Into<String>) -> Self {
        ChannelOptions {
            authority: authority.into(),
            ..Default::default()
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            authority: String::new(),
            default_lb_policy: crate::client::load_balancing::pick_first::POLICY_NAME.to_string(),
            connect_backoff: BackoffConfig::default(),
            min_connect_timeout: Duration::from_secs(20),
            min_reresolution_interval: Duration::from_secs(30),
        }
    }
}

/// The output of a name resolver, as handed to [`LbChannel::update`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ResolverResult {
    /// The resolved endpoints, or the error the resolver encountered. `None`
    /// leaves the addresses of the previous update in place.
    pub addresses: Option<Result<Vec<EndpointAddress>, Status>>,
    /// The `loadBalancingConfig` value of the service config, if any.
    pub lb_config: Option<serde_json::Value>,
    pub resolution_note: Option<String>,
}

impl ResolverResult {
    pub fn with_addresses(addresses: Vec<EndpointAddress>) -> Self {
        ResolverResult {
            addresses: Some(Ok(addresses)),
            ..Default::default()
        }
    }

    pub fn with_error(status: Status) -> Self {
        ResolverResult {
            addresses: Some(Err(status)),
            ..Default::default()
        }
    }

    pub fn lb_config(mut self, config: Option<serde_json::Value>) -> Self {
        self.lb_config = config;
        self
    }

    pub fn resolution_note(mut self, note: impl Into<String>) -> Self {
        self.resolution_note = Some(note.into());
        self
    }
}

// State read by callers outside the serializer.
struct Shared {
    current: ArcSwap<StateUpdate>,
    picker_changed: Notify,
    tracker: ConnectivityStateTracker,
    // Guards publication against a concurrent shutdown.
    shut_down: Mutex<bool>,
}

impl Shared {
    fn publish(&self, update: StateUpdate, reason: &str) {
        let (state, status) = (update.connectivity_state, update.status.clone());
        {
            let shut_down = self.shut_down.lock();
            if *shut_down {
                trace!("ignoring {state} update after channel shutdown");
                return;
            }
            self.current.store(Arc::new(update));
        }
        self.notify(state, status, reason);
    }

    // Publishes the final Shutdown state. Returns false if that already
    // happened.
    fn shutdown(&self) -> bool {
        {
            let mut shut_down = self.shut_down.lock();
            if std::mem::replace(&mut *shut_down, true) {
                return false;
            }
            let picker = Arc::new(DropPicker {
                status: Status::unavailable("channel shut down"),
            });
            self.current.store(Arc::new(StateUpdate::new(
                ConnectivityState::Shutdown,
                Status::ok(),
                picker,
            )));
        }
        self.notify(ConnectivityState::Shutdown, Status::ok(), "channel shutdown");
        true
    }

    // Runs with `shut_down` released: watchers may call back into the
    // channel. The picker is already stored, so a watcher picking from
    // within its callback sees the picker that came with the state. A
    // publication racing with shutdown is ignored by the tracker once it is
    // in Shutdown.
    fn notify(&self, state: ConnectivityState, status: Status, reason: &str) {
        self.tracker.set_state(state, status, reason);
        self.picker_changed.notify_waiters();
    }
}

/// Forwards re-resolution requests to the resolver, at most once per
/// `min_interval`. A request arriving too early is deferred to the end of
/// the interval; further requests until then are merged into it.
struct ReresolutionThrottle {
    requester: Arc<dyn ResolutionRequester>,
    runtime: Arc<dyn Runtime>,
    min_interval: Duration,
    window: Arc<Mutex<ThrottleWindow>>,
    task: Option<BoxedTaskHandle>,
}

#[derive(Default)]
struct ThrottleWindow {
    // A request was sent less than `min_interval` ago.
    open: bool,
    // A request arrived while the window was open.
    pending: bool,
}

impl ReresolutionThrottle {
    fn new(
        requester: Arc<dyn ResolutionRequester>,
        runtime: Arc<dyn Runtime>,
        min_interval: Duration,
    ) -> Self {
        ReresolutionThrottle {
            requester,
            runtime,
            min_interval,
            window: Arc::default(),
            task: None,
        }
    }

    fn request(&mut self) {
        {
            let mut window = self.window.lock();
            if window.open {
                if !window.pending {
                    debug!("delaying re-resolution until {:?} after the last one", self.min_interval);
                }
                window.pending = true;
                return;
            }
            window.open = true;
        }
        self.requester.request_resolution();

        // Closes the window after `min_interval`, first sending the request
        // deferred meanwhile, which opens a new window.
        let runtime = self.runtime.clone();
        let requester = self.requester.clone();
        let window = self.window.clone();
        let min_interval = self.min_interval;
        let task = self.runtime.spawn(Box::pin(async move {
            loop {
                runtime.sleep(min_interval).await;
                let deferred = {
                    let mut window = window.lock();
                    window.open = std::mem::take(&mut window.pending);
                    window.open
                };
                if !deferred {
                    break;
                }
                trace!("sending deferred re-resolution request");
                requester.request_resolution();
            }
        }));
        if let Some(old) = self.task.replace(task) {
            old.abort();
        }
    }
}

impl Drop for ReresolutionThrottle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// Hands `work` calls to the policy of one generation. Stale schedulers held
// by pickers of a replaced policy are ignored.
struct SerializerWorkScheduler {
    serializer: WeakWorkSerializer<ChannelCore>,
    pending: Arc<AtomicBool>,
    generation: u64,
}

impl WorkScheduler for SerializerWorkScheduler {
    fn schedule_work(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = self.pending.clone();
        let generation = self.generation;
        let scheduled = self.serializer.schedule(move |core: &mut ChannelCore| {
            pending.store(false, Ordering::Release);
            core.work(generation);
        });
        if scheduled.is_err() {
            self.pending.store(false, Ordering::Release);
        }
    }
}

// The channel's side of the ChannelControlHelper. Kept apart from the policy
// so both can be borrowed mutably at once.
struct ChannelEnv {
    authority: String,
    pool: Arc<SubchannelPool>,
    sink: SubchannelEventSink,
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn Runtime>,
    connect_config: ConnectConfig,
    shared: Arc<Shared>,
    throttle: ReresolutionThrottle,
}

impl ChannelControlHelper for ChannelEnv {
    fn create_subchannel(&mut self, address: &Address, args: &ChannelArgs) -> Arc<dyn Subchannel> {
        let key = SubchannelKey::new(address.clone(), args.clone());
        let transport = self.transport.clone();
        let runtime = self.runtime.clone();
        let config = &self.connect_config;
        let isc = self.pool.get_or_create(key, |key, pool| {
            InternalSubchannel::new(key, transport, runtime, config, pool)
        });
        ExternalSubchannel::new(isc, self.sink.clone())
    }

    fn update_state(&mut self, update: StateUpdate) {
        self.shared.publish(update, "picker update");
    }

    fn request_reresolution(&mut self) {
        self.throttle.request();
    }

    fn authority(&self) -> &str {
        &self.authority
    }

    fn runtime(&self) -> Arc<dyn Runtime> {
        self.runtime.clone()
    }

    fn add_trace_event(&mut self, severity: TraceSeverity, message: &str) {
        match severity {
            TraceSeverity::Info => info!(authority = %self.authority, "{message}"),
            TraceSeverity::Warning => warn!(authority = %self.authority, "{message}"),
            TraceSeverity::Error => error!(authority = %self.authority, "{message}"),
        }
    }
}

// Everything owned by the work serializer.
struct ChannelCore {
    serializer: WeakWorkSerializer<ChannelCore>,
    registry: Arc<LbPolicyRegistry>,
    default_lb_policy: String,
    policy: Option<ManagedPolicy>,
    // The last config that parsed successfully.
    config: Option<LbConfig>,
    generation: u64,
    env: ChannelEnv,
}

impl ChannelCore {
    fn resolver_update(&mut self, result: ResolverResult) -> Result<(), Status> {
        let mut config_error = None;
        if let Some(value) = &result.lb_config {
            match self.registry.parse_config(value) {
                Ok(config) => self.config = Some(config),
                Err(err) => {
                    warn!("rejecting load balancing config: {err}");
                    config_error = Some(Status::from(err));
                }
            }
        }
        let config = match &self.config {
            Some(config) => config.clone(),
            None => self.default_config()?,
        };

        let name = config.policy_name().to_string();
        let old = if self.policy.as_ref().map(ManagedPolicy::name) != Some(name.as_str()) {
            let policy = self.build_policy(&name)?;
            self.policy.replace(policy)
        } else {
            None
        };

        let update = UpdateArgs {
            addresses: result.addresses,
            config: Some(config),
            resolution_note: result.resolution_note,
        };
        let res = match self.policy.as_mut() {
            Some(policy) => policy.resolver_update(update, &mut self.env),
            None => Ok(()),
        };
        if let Some(mut old) = old {
            old.shutdown(&mut self.env);
        }
        res?;
        config_error.map_or(Ok(()), Err)
    }

    fn default_config(&self) -> Result<LbConfig, Status> {
        let mut entry = serde_json::Map::new();
        entry.insert(
            self.default_lb_policy.clone(),
            serde_json::Value::Object(serde_json::Map::new()),
        );
        let value = serde_json::Value::Object(entry);
        self.registry.parse_config(&value).map_err(Status::from)
    }

    fn build_policy(&mut self, name: &str) -> Result<ManagedPolicy, Status> {
        self.generation += 1;
        debug!(generation = self.generation, "creating {name} policy");
        let work_scheduler = Arc::new(SerializerWorkScheduler {
            serializer: self.serializer.clone(),
            pending: Arc::default(),
            generation: self.generation,
        });
        let options = LbPolicyOptions::new(
            work_scheduler,
            self.env.runtime.clone(),
            self.env.authority.clone(),
        );
        let policy = self.registry.create(name, options)?;
        Ok(ManagedPolicy::new(name, policy))
    }

    fn subchannel_event(&mut self, event: SubchannelEvent) {
        if !event.is_active() {
            trace!(subchannel = %event.subchannel, "dropping stale subchannel event");
            return;
        }
        if let Some(policy) = self.policy.as_mut() {
            policy.subchannel_update(event.subchannel, &event.state, &mut self.env);
        }
    }

    fn work(&mut self, generation: u64) {
        if generation != self.generation {
            trace!(generation, "ignoring work for replaced policy");
            return;
        }
        if let Some(policy) = self.policy.as_mut() {
            policy.work(&mut self.env);
        }
    }

    fn exit_idle(&mut self) {
        if let Some(policy) = self.policy.as_mut() {
            policy.exit_idle(&mut self.env);
        }
    }

    fn reset_backoff(&mut self) {
        if let Some(policy) = self.policy.as_mut() {
            policy.reset_backoff(&mut self.env);
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut policy) = self.policy.take() {
            policy.shutdown(&mut self.env);
        }
    }
}

/// A channel's load balancing machinery: the LB policy, the subchannels it
/// created and the picker it published.
///
/// Policy and subchannel callbacks all run on the channel's work serializer.
/// Picks read the current picker without synchronizing with it.
pub struct LbChannel {
    serializer: WorkSerializer<ChannelCore>,
    shared: Arc<Shared>,
}

impl LbChannel {
    /// Creates an Idle channel. No policy exists until the first resolver
    /// update arrives; picks queue until then.
    pub fn new(
        options: ChannelOptions,
        registry: Arc<LbPolicyRegistry>,
        transport: Arc<dyn Transport>,
        runtime: Arc<dyn Runtime>,
        requester: Arc<dyn ResolutionRequester>,
    ) -> Result<Self, LbError> {
        if registry.get_policy(&options.default_lb_policy).is_none() {
            return Err(LbError::PolicyNotFound(options.default_lb_policy));
        }
        options
            .connect_backoff
            .validate()
            .map_err(|reason| LbError::invalid_config("connectBackoff", reason))?;

        let shared = Arc::new(Shared {
            current: ArcSwap::from_pointee(StateUpdate::idle(Arc::new(QueuingPicker {}))),
            picker_changed: Notify::new(),
            tracker: ConnectivityStateTracker::new(
                format!("channel {}", options.authority),
                ConnectivityState::Idle,
                Status::ok(),
            ),
            shut_down: Mutex::new(false),
        });
        let core_shared = shared.clone();
        let serializer = WorkSerializer::new_cyclic("lb channel", runtime.as_ref(), |serializer| {
            let weak = serializer.downgrade();
            let sink: SubchannelEventSink = Arc::new(move |event: SubchannelEvent| {
                let _ = weak.schedule(move |core: &mut ChannelCore| core.subchannel_event(event));
            });
            ChannelCore {
                serializer: serializer.downgrade(),
                registry,
                default_lb_policy: options.default_lb_policy,
                policy: None,
                config: None,
                generation: 0,
                env: ChannelEnv {
                    authority: options.authority,
                    pool: SubchannelPool::new(),
                    sink,
                    transport,
                    runtime: runtime.clone(),
                    connect_config: ConnectConfig {
                        backoff: options.connect_backoff,
                        min_connect_timeout: options.min_connect_timeout,
                    },
                    shared: core_shared,
                    throttle: ReresolutionThrottle::new(
                        requester,
                        runtime.clone(),
                        options.min_reresolution_interval,
                    ),
                },
            }
        });
        Ok(LbChannel { serializer, shared })
    }

    /// Hands a resolver result to the LB policy, switching policies when the
    /// configured policy changes.
    ///
    /// An invalid load balancing config is reported as an error while the
    /// update is still applied with the last valid config.
    pub async fn update(&self, result: ResolverResult) -> Result<(), Status> {
        self.serializer
            .run(move |core| core.resolver_update(result))
            .await
            .map_err(Status::from)?
    }

    /// Picks with the current picker.
    pub fn pick(&self, path: &str, metadata: &MetadataMap, call_state: &mut CallState) -> PickResult {
        let current = self.shared.current.load();
        current.picker.pick(PickArgs {
            path,
            metadata,
            call_state,
        })
    }

    /// Picks, retrying every time a new picker is published while the pick
    /// is queued. `Fail` results end the call unless it is wait-for-ready;
    /// `Drop` results always do.
    pub async fn pick_queued(
        &self,
        path: &str,
        metadata: &MetadataMap,
        call_state: &mut CallState,
        options: &CallOptions,
    ) -> Result<Pick, Status> {
        loop {
            let notified = self.shared.picker_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.pick(path, metadata, call_state) {
                PickResult::Complete(pick) => return Ok(pick),
                PickResult::Queue => trace!(path, "pick queued"),
                PickResult::Fail(status) if options.wait_for_ready => {
                    trace!(path, %status, "wait-for-ready pick failed, waiting for a new picker");
                }
                PickResult::Fail(status) | PickResult::Drop(status) => return Err(status),
            }
            notified.await;
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.shared.tracker.state()
    }

    /// Registers `watcher` for channel state changes. It is called with the
    /// current state right away.
    pub fn watch_state(&self, watcher: Arc<dyn ConnectivityStateWatcher>) -> WatcherId {
        self.shared.tracker.add_watcher(watcher)
    }

    pub fn cancel_state_watch(&self, id: WatcherId) -> bool {
        self.shared.tracker.remove_watcher(id)
    }

    /// Asks the policy to leave Idle.
    pub fn exit_idle(&self) -> Result<(), LbError> {
        self.serializer.schedule(ChannelCore::exit_idle)
    }

    /// Asks the policy to reset the connection backoff of its subchannels.
    pub fn reset_backoff(&self) -> Result<(), LbError> {
        self.serializer.schedule(ChannelCore::reset_backoff)
    }

    /// Shuts the channel down. Picks are dropped from here on and the state
    /// becomes Shutdown. Calling it again has no effect.
    pub fn shutdown(&self) {
        if !self.shared.shutdown() {
            return;
        }
        debug!("shutting down channel");
        let _ = self.serializer.schedule(ChannelCore::shutdown);
        self.serializer.shutdown();
    }
}

impl Drop for LbChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
