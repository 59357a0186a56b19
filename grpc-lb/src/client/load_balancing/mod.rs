/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use tonic::metadata::MetadataMap;

use crate::client::ConnectivityState;
use crate::client::channel_args::ChannelArgs;
use crate::client::connectivity_state::validate_state_status;
use crate::client::name_resolution::{Address, UpdateArgs};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::error::LbError;
use crate::rt::Runtime;
use crate::status::Status;

pub mod lifecycle;
pub mod pick_first;
pub mod registry;
pub mod round_robin;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::client::subchannel::{
    Subchannel, SubchannelEvent, SubchannelState, WatchHandle, same_subchannel,
};
pub use lifecycle::{Lifecycle, ManagedPolicy};
pub use registry::LbPolicyRegistry;

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
#[non_exhaustive]
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelControlHelper.
    pub work_scheduler: Arc<dyn WorkScheduler>,

    /// The runtime which provides utilities to do async work.
    pub runtime: Arc<dyn Runtime>,

    /// The authority of the channel constructing the policy.
    pub authority: String,
}

impl LbPolicyOptions {
    pub fn new(
        work_scheduler: Arc<dyn WorkScheduler>,
        runtime: Arc<dyn Runtime>,
        authority: impl Into<String>,
    ) -> Self {
        LbPolicyOptions {
            work_scheduler,
            runtime,
            authority: authority.into(),
        }
    }
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(&self, _config: &ParsedJsonLbConfig) -> Result<Option<LbConfig>, LbError> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
///
/// All methods are invoked from the channel's work serializer, never
/// concurrently. Every method receives the helper to use for the duration of
/// the call.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new config.
    ///
    /// The policy must publish at least one state update in response, either
    /// directly or by scheduling work. A config of the wrong type is rejected
    /// with an error and the previous config stays in effect.
    fn resolver_update(
        &mut self,
        update: UpdateArgs,
        helper: &mut dyn ChannelControlHelper,
    ) -> Result<(), Status>;

    /// Called by the channel when any subchannel watched by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        helper: &mut dyn ChannelControlHelper,
    );

    /// Called by the channel when the policy should leave Idle, e.g. because
    /// a call was started.
    fn exit_idle(&mut self, helper: &mut dyn ChannelControlHelper);

    /// Called by the channel to reset connection backoff of all subchannels.
    fn reset_backoff(&mut self, helper: &mut dyn ChannelControlHelper);

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, helper: &mut dyn ChannelControlHelper);

    /// Called exactly once when the channel discards the policy. The policy
    /// must cancel all of its watches and release its subchannels.
    fn shutdown(&mut self, helper: &mut dyn ChannelControlHelper);
}

/// Severity of a channel trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSeverity {
    Info,
    Warning,
    Error,
}

/// The policy's view of the channel.
///
/// Only used from within the work serializer, while the policy is handling a
/// call from the channel.
pub trait ChannelControlHelper {
    /// Creates a subchannel for `address`. The subchannel starts Idle unless
    /// it shares an existing connection with the same address and args.
    fn create_subchannel(&mut self, address: &Address, args: &ChannelArgs) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_state(&mut self, update: StateUpdate);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration. The channel may rate limit these requests.
    fn request_reresolution(&mut self);

    /// The authority of the channel.
    fn authority(&self) -> &str;

    /// The runtime of the channel.
    fn runtime(&self) -> Arc<dyn Runtime>;

    /// Records a trace event for the channel. Best effort.
    fn add_trace_event(&mut self, severity: TraceSeverity, message: &str);
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct StateUpdate {
    pub connectivity_state: ConnectivityState,
    /// Non-OK exactly when the state is TransientFailure.
    pub status: Status,
    pub picker: Arc<dyn Picker>,
}

impl StateUpdate {
    pub fn new(
        connectivity_state: ConnectivityState,
        status: Status,
        picker: Arc<dyn Picker>,
    ) -> Self {
        StateUpdate {
            connectivity_state,
            status,
            picker,
        }
    }

    /// Connecting with a picker which queues all picks. Also the state of a
    /// policy that has not heard from the resolver yet.
    pub fn connecting() -> Self {
        Self::new(
            ConnectivityState::Connecting,
            Status::ok(),
            Arc::new(QueuingPicker {}),
        )
    }

    pub fn idle(picker: Arc<dyn Picker>) -> Self {
        Self::new(ConnectivityState::Idle, Status::ok(), picker)
    }

    pub fn ready(picker: Arc<dyn Picker>) -> Self {
        Self::new(ConnectivityState::Ready, Status::ok(), picker)
    }

    /// TransientFailure with a picker failing every pick with `status`.
    pub fn transient_failure(status: Status) -> Self {
        Self::new(
            ConnectivityState::TransientFailure,
            status.clone(),
            Arc::new(FailingPicker { status }),
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_state_status(self.connectivity_state, &self.status)
    }
}

impl Debug for StateUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateUpdate")
            .field("connectivity_state", &self.connectivity_state)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Typed storage scoped to a single call, which pickers may use to hand data
/// to later stages of the call.
#[derive(Debug, Default, Clone)]
pub struct CallState {
    extensions: http::Extensions,
}

impl CallState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.extensions.get_mut()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.extensions.remove()
    }
}

/// The inputs to a pick.
pub struct PickArgs<'a> {
    /// The full method name of the call, e.g. `/pkg.Service/Method`.
    pub path: &'a str,
    /// The call's initial metadata.
    pub metadata: &'a MetadataMap,
    pub call_state: &'a mut CallState,
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns Queue,
/// the channel will queue the RPC until a new Picker is produced by the
/// LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return a
/// Fail result with a status that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    fn pick(&self, args: PickArgs<'_>) -> PickResult;
}

/// Observes a call that was routed to a subchannel.
pub trait SubchannelCallTracker: Send {
    /// Called when the call starts on the subchannel.
    fn start(&mut self);

    /// Called when the call finishes with `status`.
    fn finish(&mut self, status: &Status);
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Complete(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status.
    /// If the RPC is wait-for-ready,
    /// then it will not be terminated, but instead attempted on a new picker if
    /// one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.
    Drop(Status),
}

impl PickResult {
    pub fn is_queue(&self) -> bool {
        matches!(self, PickResult::Queue)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, PickResult::Complete(_))
    }
}

impl Display for PickResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete(pick) => write!(f, "Complete({})", pick.subchannel),
            Self::Queue => write!(f, "Queue"),
            Self::Fail(st) => write!(f, "Fail({st})"),
            Self::Drop(st) => write!(f, "Drop({st})"),
        }
    }
}

impl Debug for PickResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    // Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
    /// Notified when the call starts and finishes, if set.
    pub call_tracker: Option<Box<dyn SubchannelCallTracker>>,
}

impl Pick {
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Pick {
            subchannel,
            metadata: MetadataMap::new(),
            call_tracker: None,
        }
    }
}

impl Debug for Pick {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pick")
            .field("subchannel", &self.subchannel)
            .field("metadata", &self.metadata)
            .field("call_tracker", &self.call_tracker.is_some())
            .finish()
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// FailingPicker fails every pick with the same status.
pub struct FailingPicker {
    pub status: Status,
}

impl Picker for FailingPicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}

/// DropPicker drops every pick, failing even wait-for-ready calls.
pub struct DropPicker {
    pub status: Status,
}

impl Picker for DropPicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        PickResult::Drop(self.status.clone())
    }
}

// A picker that always queues picks and schedules work. This triggers the LB
// policy to leave Idle.
pub struct IdlePicker {
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}
