use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::client::ConnectivityState;
use crate::client::load_balancing::registry::LbPolicyRegistry;
use crate::client::load_balancing::utils::{WatchedSubchannel, with_resolution_note};
use crate::client::load_balancing::{
    ChannelControlHelper, IdlePicker, LbPolicy, LbPolicyBuilder, LbPolicyOptions, Pick,
    PickArgs, PickResult, Picker, StateUpdate, Subchannel, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{EndpointAddress, UpdateArgs};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::error::LbError;
use crate::status::Status;

// A function type that takes a mutable slice of endpoints and shuffles them.
pub(crate) type EndpointShuffler = dyn Fn(&mut [EndpointAddress]) + Send + Sync + 'static;

fn thread_rng_shuffler() -> Arc<EndpointShuffler> {
    Arc::new(|endpoints: &mut [EndpointAddress]| {
        endpoints.shuffle(&mut rand::rng());
    })
}

pub static POLICY_NAME: &str = "pick_first";

pub(crate) struct Builder {
    shuffler: Arc<EndpointShuffler>,
}

impl Builder {
    #[cfg(test)]
    pub(crate) fn with_shuffler(shuffler: Arc<EndpointShuffler>) -> Self {
        Builder { shuffler }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            shuffler: thread_rng_shuffler(),
        }
    }
}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            shuffler: self.shuffler.clone(),
            config: Arc::default(),
            subchannel_list: None,
            selected_subchannel: None,
            addresses: vec![],
            last_resolver_error: None,
            last_connection_error: None,
            last_update: None,
            connectivity_state: ConnectivityState::Connecting,
            sent_connecting_state: false,
            num_transient_failures: 0,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(&self, config: &ParsedJsonLbConfig) -> Result<Option<LbConfig>, LbError> {
        let cfg: PickFirstConfig = config
            .convert_to()
            .map_err(|e| LbError::invalid_config(POLICY_NAME, format!("failed to parse JSON config: {e}")))?;
        Ok(Some(LbConfig::new(POLICY_NAME, cfg)))
    }
}

/// The configuration of the pick_first policy.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PickFirstConfig {
    /// Randomly shuffles the endpoints of every address list before use.
    pub shuffle_address_list: Option<bool>,
}

pub(crate) fn reg(registry: &LbPolicyRegistry) {
    registry.add_builder(Builder::default());
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>, // Helps to schedule work.
    shuffler: Arc<EndpointShuffler>,
    config: Arc<PickFirstConfig>,            // Most recent valid config.
    subchannel_list: Option<SubchannelList>, // List of subchannels, that we are currently connecting to.
    selected_subchannel: Option<WatchedSubchannel>, // The currently connected subchannel.
    addresses: Vec<EndpointAddress>,         // Most recent addresses from the name resolver.
    last_resolver_error: Option<Status>,     // Most recent error from the name resolver.
    last_connection_error: Option<Status>,   // Most recent error from any subchannel.
    last_update: Option<StateUpdate>,        // Most recent update sent to the channel.
    connectivity_state: ConnectivityState,   // Overall connectivity state of the channel.
    sent_connecting_state: bool, // Whether we have sent a CONNECTING state to the channel.
    num_transient_failures: usize, // Number of transient failures after the end of the first pass.
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: UpdateArgs,
        helper: &mut dyn ChannelControlHelper,
    ) -> Result<(), Status> {
        if let Some(config) = &update.config {
            match config.convert_to::<PickFirstConfig>() {
                Some(cfg) => self.config = cfg,
                None => {
                    warn!("pick_first received a config for {}", config.policy_name());
                    return Err(Status::invalid_argument(format!(
                        "pick_first: unexpected config for policy {}",
                        config.policy_name()
                    )));
                }
            }
        }

        let note = update.resolution_note.as_deref();
        match update.addresses {
            None => {
                // The address list is unchanged.
                if self.addresses.is_empty() {
                    self.move_to_transient_failure(helper);
                } else {
                    self.republish(helper);
                }
                Ok(())
            }
            Some(Ok(mut endpoints)) => {
                debug!("received update from resolver with endpoints: {endpoints:?}");
                if self.config.shuffle_address_list == Some(true) {
                    (self.shuffler)(&mut endpoints);
                }
                let new_addresses = address_list_from_endpoints(endpoints);

                // Treat empty resolver updates identically to resolver errors
                // that occur before any valid update has been received.
                if new_addresses.is_empty() {
                    let status = with_resolution_note(
                        Status::unavailable("received empty address list from the name resolver"),
                        note,
                    );
                    self.handle_empty_endpoints(status.clone(), helper);
                    return Err(status);
                }
                self.update_addresses(new_addresses, helper);
                Ok(())
            }
            Some(Err(status)) => {
                debug!("received error from resolver: {status}");
                self.last_resolver_error = Some(with_resolution_note(status, note));

                // Enter or stay in TF, if there is no good previous update from
                // the resolver, or if already in TF. Regardless, send a new
                // failing picker with the updated error information.
                if self.addresses.is_empty()
                    || self.connectivity_state == ConnectivityState::TransientFailure
                {
                    self.move_to_transient_failure(helper);
                } else {
                    // Continue using the previous good update.
                    self.republish(helper);
                }
                Ok(())
            }
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        helper: &mut dyn ChannelControlHelper,
    ) {
        trace!("received update for {}: {:?}", subchannel, state);

        // Handle the update for this subchannel, provided it's included in the
        // subchannel list (if the list exists).
        if let Some(subchannel_list) = &self.subchannel_list {
            if subchannel_list.contains(&subchannel) {
                if state.connectivity_state == ConnectivityState::Ready {
                    self.move_to_ready(&subchannel, helper);
                } else {
                    self.update_tracked_subchannel(&subchannel, state, helper);
                }
                return;
            }
        }

        // Handle updates for the currently selected subchannel. Any state
        // change for the currently connected subchannel means that we are no
        // longer connected.
        if let Some(selected) = &self.selected_subchannel {
            if selected.is(&subchannel) {
                if state.connectivity_state != ConnectivityState::Ready {
                    self.move_to_idle(helper);
                }
                return;
            }
        }

        warn!("pick_first ignoring update for unknown subchannel {subchannel}");
    }

    fn exit_idle(&mut self, helper: &mut dyn ChannelControlHelper) {
        if self.connectivity_state == ConnectivityState::Idle {
            self.start_connecting(helper);
        }
    }

    fn reset_backoff(&mut self, _helper: &mut dyn ChannelControlHelper) {
        if let Some(list) = &self.subchannel_list {
            for data in &list.subchannels {
                data.watched.subchannel.reset_backoff();
            }
        }
        if let Some(selected) = &self.selected_subchannel {
            selected.subchannel.reset_backoff();
        }
    }

    fn work(&mut self, helper: &mut dyn ChannelControlHelper) {
        // The idle picker asked us to connect. Build a new subchannel list with
        // the most recent addresses received from the name resolver. This
        // will start connecting from the first address in the list.
        if self.connectivity_state == ConnectivityState::Idle {
            self.start_connecting(helper);
        }
    }

    fn shutdown(&mut self, _helper: &mut dyn ChannelControlHelper) {
        debug!("pick_first shutting down");
        self.subchannel_list = None;
        self.selected_subchannel = None;
        self.last_update = None;
        self.connectivity_state = ConnectivityState::Shutdown;
    }
}

impl PickFirstPolicy {
    fn update_addresses(
        &mut self,
        new_addresses: Vec<EndpointAddress>,
        helper: &mut dyn ChannelControlHelper,
    ) {
        // Nothing to reconcile if the list is identical to the one in use.
        let in_use = self.subchannel_list.is_some() || self.selected_subchannel.is_some();
        if in_use && new_addresses == self.addresses {
            self.republish(helper);
            return;
        }
        self.addresses = new_addresses;

        // Start using the new address list unless in IDLE, in which case, we
        // rely on exit_idle() for the same.
        if self.connectivity_state == ConnectivityState::Idle {
            self.republish(helper);
            return;
        }

        // Keep the connected subchannel if the resolver still returns it.
        if let Some(selected) = &self.selected_subchannel {
            let still_present = self.addresses.iter().any(|ep| {
                &ep.address == selected.subchannel.address()
                    && &ep.args == selected.subchannel.args()
            });
            if still_present {
                self.subchannel_list = None;
                self.republish(helper);
                return;
            }
            debug!("selected subchannel {} removed by resolver", selected.subchannel);
            self.selected_subchannel = None;
        }

        let previous = self.subchannel_list.take();
        self.subchannel_list = Some(SubchannelList::new(&self.addresses, previous, helper));
        if !self.sent_connecting_state
            && self.connectivity_state != ConnectivityState::TransientFailure
        {
            self.move_to_connecting(helper);
        } else {
            self.republish(helper);
        }
        self.start_first_pass_if_ready(helper);
    }

    fn start_connecting(&mut self, helper: &mut dyn ChannelControlHelper) {
        if self.addresses.is_empty() {
            return;
        }
        self.subchannel_list = Some(SubchannelList::new(&self.addresses, None, helper));
        self.move_to_connecting(helper);
        self.start_first_pass_if_ready(helper);
    }

    // Handles the case when the resolver returns an empty address list. Resets
    // internal state and moves to TRANSIENT_FAILURE.
    fn handle_empty_endpoints(&mut self, status: Status, helper: &mut dyn ChannelControlHelper) {
        self.subchannel_list = None;
        self.selected_subchannel = None;
        self.addresses = vec![];
        self.last_resolver_error = Some(status);
        self.move_to_transient_failure(helper);
    }

    // Starts the first connection pass once every subchannel in the list has
    // reported its initial state.
    fn start_first_pass_if_ready(&mut self, helper: &mut dyn ChannelControlHelper) {
        let Some(subchannel_list) = self.subchannel_list.as_mut() else {
            return;
        };
        if !subchannel_list.all_subchannels_seen_initial_state() {
            return;
        }
        if !subchannel_list.connect_to_next_subchannel() {
            // Every subchannel is already failing.
            self.end_first_pass(helper);
        }
    }

    // Move to TRANSIENT_FAILURE and attempt to connect to all subchannels once
    // we get to the end of the list.
    fn end_first_pass(&mut self, helper: &mut dyn ChannelControlHelper) {
        self.num_transient_failures = 0;
        self.move_to_transient_failure(helper);
        debug!("first pass complete, connecting to all subchannels");
        if let Some(subchannel_list) = self.subchannel_list.as_mut() {
            subchannel_list.first_pass_done = true;
            subchannel_list.connect_to_all_subchannels();
        }
    }

    // Handles updates for subchannels currently in the subchannel list.
    fn update_tracked_subchannel(
        &mut self,
        sc: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        helper: &mut dyn ChannelControlHelper,
    ) {
        let Some(subchannel_list) = self.subchannel_list.as_mut() else {
            return;
        };

        // Update subchannel data. Return early if not all subchannels have seen
        // their first state update.
        let initial = subchannel_list.update_subchannel_data(sc, state);
        if !subchannel_list.all_subchannels_seen_initial_state() {
            return;
        }

        // Handle the last subchannel to report its initial state.
        if initial {
            self.start_first_pass_if_ready(helper);
            return;
        }

        // Otherwise, handle the most recent subchannel state transition.
        match state.connectivity_state {
            ConnectivityState::Idle => {
                // Immediately connect to subchannels transitioning to IDLE,
                // once the first pass is complete.
                if subchannel_list.is_first_pass_complete() {
                    sc.request_connection();
                }
            }
            ConnectivityState::Connecting => {
                // If we are already in CONNECTING, ignore this update.
                if self.connectivity_state == ConnectivityState::Connecting
                    && self.sent_connecting_state
                {
                    return;
                }
                if self.connectivity_state != ConnectivityState::TransientFailure {
                    self.move_to_connecting(helper);
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = Some(state.status.clone());

                if !subchannel_list.is_first_pass_complete() {
                    // Connect to the next subchannel in the list.
                    if !subchannel_list.connect_to_next_subchannel() {
                        self.end_first_pass(helper);
                    }
                    return;
                }
                self.num_transient_failures += 1;
                if self.num_transient_failures >= subchannel_list.len() {
                    // Request re-resolution and update the error picker.
                    self.num_transient_failures = 0;
                    self.move_to_transient_failure(helper);
                }
            }
            ConnectivityState::Ready | ConnectivityState::Shutdown => {}
        }
    }

    fn publish(&mut self, update: StateUpdate, helper: &mut dyn ChannelControlHelper) {
        self.last_update = Some(update.clone());
        helper.update_state(update);
    }

    // Sends the most recent state again, e.g. with a new resolution note.
    fn republish(&mut self, helper: &mut dyn ChannelControlHelper) {
        match &self.last_update {
            Some(update) => helper.update_state(update.clone()),
            None => self.move_to_connecting(helper),
        }
    }

    fn move_to_idle(&mut self, helper: &mut dyn ChannelControlHelper) {
        self.connectivity_state = ConnectivityState::Idle;
        self.subchannel_list = None;
        self.selected_subchannel = None;
        self.publish(
            StateUpdate::idle(Arc::new(IdlePicker {
                work_scheduler: self.work_scheduler.clone(),
            })),
            helper,
        );
        helper.request_reresolution();
        self.sent_connecting_state = false;
    }

    fn move_to_connecting(&mut self, helper: &mut dyn ChannelControlHelper) {
        self.connectivity_state = ConnectivityState::Connecting;
        self.publish(StateUpdate::connecting(), helper);
        self.sent_connecting_state = true;
    }

    fn move_to_ready(&mut self, sc: &Arc<dyn Subchannel>, helper: &mut dyn ChannelControlHelper) {
        let Some(mut watched) = self
            .subchannel_list
            .take()
            .and_then(|list| list.into_subchannel(sc))
        else {
            return;
        };
        watched.state = SubchannelState::ready();
        debug!("pick_first connected to {}", watched.subchannel);

        self.connectivity_state = ConnectivityState::Ready;
        self.last_connection_error = None;
        self.last_resolver_error = None;
        self.num_transient_failures = 0;
        let picker = Arc::new(OneSubchannelPicker {
            sc: watched.subchannel.clone(),
        });
        self.selected_subchannel = Some(watched);
        self.publish(StateUpdate::ready(picker), helper);
        self.sent_connecting_state = false;
    }

    fn move_to_transient_failure(&mut self, helper: &mut dyn ChannelControlHelper) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let status = match (&self.last_connection_error, &self.last_resolver_error) {
            (Some(err), _) | (None, Some(err)) if !err.is_ok() => err.clone(),
            _ => Status::unavailable("pick_first: no usable address"),
        };
        self.publish(StateUpdate::transient_failure(status), helper);
        helper.request_reresolution();
        self.sent_connecting_state = false;
    }
}

// Flattens the endpoints, removing duplicate addresses.
fn address_list_from_endpoints(endpoints: Vec<EndpointAddress>) -> Vec<EndpointAddress> {
    let mut uniques = HashSet::new();
    endpoints
        .into_iter()
        .filter(|ep| uniques.insert(ep.address.clone()))
        .collect()
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    sc: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        PickResult::Complete(Pick::new(self.sc.clone()))
    }
}

// Data tracked for each subchannel in the subchannel list.
struct SubchannelData {
    watched: WatchedSubchannel,
    seen_initial_state: bool,
}

// A list of subchannels created from the most recent address list from the
// resolver.
//
// The list tracks the state of each subchannel, and helps to manage connection
// attempts to the subchannels in the list.
struct SubchannelList {
    subchannels: Vec<SubchannelData>,
    next_idx: usize,
    first_pass_done: bool,
}

impl SubchannelList {
    // Creates a list for `addresses`, taking over the subchannels of
    // `previous` whose address and args are unchanged. Subchannels of
    // `previous` that are not taken over are released.
    fn new(
        addresses: &[EndpointAddress],
        previous: Option<SubchannelList>,
        helper: &mut dyn ChannelControlHelper,
    ) -> Self {
        let mut reusable: HashMap<(_, _), SubchannelData> = previous
            .map(|list| list.subchannels)
            .unwrap_or_default()
            .into_iter()
            .map(|data| {
                let key = (
                    data.watched.subchannel.address().clone(),
                    data.watched.subchannel.args().clone(),
                );
                (key, data)
            })
            .collect();

        let subchannels: Vec<SubchannelData> = addresses
            .iter()
            .map(|ep| {
                let key = (ep.address.clone(), ep.args.clone());
                reusable.remove(&key).unwrap_or_else(|| SubchannelData {
                    watched: WatchedSubchannel::new(
                        helper.create_subchannel(&ep.address, &ep.args),
                    ),
                    seen_initial_state: false,
                })
            })
            .collect();

        debug!(
            "created new subchannel list with {} subchannels",
            subchannels.len()
        );
        SubchannelList {
            subchannels,
            next_idx: 0,
            first_pass_done: false,
        }
    }

    fn len(&self) -> usize {
        self.subchannels.len()
    }

    fn contains(&self, sc: &Arc<dyn Subchannel>) -> bool {
        self.subchannels.iter().any(|data| data.watched.is(sc))
    }

    fn into_subchannel(self, sc: &Arc<dyn Subchannel>) -> Option<WatchedSubchannel> {
        self.subchannels
            .into_iter()
            .find(|data| data.watched.is(sc))
            .map(|data| data.watched)
    }

    // Updates internal state of the subchannel with the new state.
    //
    // Returns true if this was the subchannel's initial state.
    fn update_subchannel_data(&mut self, sc: &Arc<dyn Subchannel>, state: &SubchannelState) -> bool {
        let Some(data) = self.subchannels.iter_mut().find(|data| data.watched.is(sc)) else {
            return false;
        };
        let initial = !data.seen_initial_state;
        data.seen_initial_state = true;
        data.watched.state = state.clone();
        initial
    }

    fn all_subchannels_seen_initial_state(&self) -> bool {
        self.subchannels.iter().all(|data| data.seen_initial_state)
    }

    // Initiates a connection attempt to the next subchannel in the list that is
    // IDLE, or waits on one that is already CONNECTING. Returns false if there
    // are no more subchannels in the list.
    fn connect_to_next_subchannel(&mut self) -> bool {
        while self.next_idx < self.subchannels.len() {
            let data = &self.subchannels[self.next_idx];
            self.next_idx += 1;
            match data.watched.state.connectivity_state {
                ConnectivityState::Idle => {
                    data.watched.subchannel.request_connection();
                    return true;
                }
                ConnectivityState::Connecting => return true,
                _ => {}
            }
        }
        false
    }

    fn is_first_pass_complete(&self) -> bool {
        self.first_pass_done
    }

    fn connect_to_all_subchannels(&self) {
        for data in &self.subchannels {
            if data.watched.state.connectivity_state == ConnectivityState::Idle {
                data.watched.subchannel.request_connection();
            }
        }
    }
}
