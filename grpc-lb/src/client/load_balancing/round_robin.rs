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

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use tracing::{debug, trace};

use crate::client::ConnectivityState;
use crate::client::channel_args::ChannelArgs;
use crate::client::load_balancing::registry::LbPolicyRegistry;
use crate::client::load_balancing::utils::{
    WatchedSubchannel, aggregate_subchannel_states, with_resolution_note,
};
use crate::client::load_balancing::{
    ChannelControlHelper, LbPolicy, LbPolicyBuilder, LbPolicyOptions, Pick, PickArgs,
    PickResult, Picker, StateUpdate, Subchannel, SubchannelState,
};
use crate::client::name_resolution::{Address, EndpointAddress, UpdateArgs};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::error::LbError;
use crate::status::Status;

pub static POLICY_NAME: &str = "round_robin";

struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy::new())
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(&self, config: &ParsedJsonLbConfig) -> Result<Option<LbConfig>, LbError> {
        if !config.value.is_object() {
            return Err(LbError::invalid_config(
                POLICY_NAME,
                format!("expected an object, got {}", config.value),
            ));
        }
        let cfg: RoundRobinConfig = config
            .convert_to()
            .map_err(|e| LbError::invalid_config(POLICY_NAME, e))?;
        Ok(Some(LbConfig::new(POLICY_NAME, cfg)))
    }
}

/// round_robin accepts no options.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundRobinConfig {}

/// Register round robin as a LbPolicy.
pub(crate) fn reg(registry: &LbPolicyRegistry) {
    registry.add_builder(RoundRobinBuilder {});
}

type SubchannelId = (Address, ChannelArgs);

// What was last sent to the channel, to suppress duplicate updates.
#[derive(PartialEq)]
struct Published {
    state: ConnectivityState,
    status: Status,
    ready: Vec<SubchannelId>,
}

struct RoundRobinPolicy {
    // The subchannels in resolver order. Each carries its effective state:
    // a subchannel stays in TRANSIENT_FAILURE until it becomes READY again,
    // and IDLE is reported as CONNECTING since it is reconnected at once.
    subchannels: Vec<WatchedSubchannel>,
    published: Option<Published>,
    last_update: Option<StateUpdate>,
}

impl RoundRobinPolicy {
    fn new() -> Self {
        Self {
            subchannels: vec![],
            published: None,
            last_update: None,
        }
    }

    // Reconciles the subchannels with `endpoints`, keeping the subchannels
    // whose address and args are unchanged.
    fn update_subchannels(
        &mut self,
        endpoints: Vec<EndpointAddress>,
        helper: &mut dyn ChannelControlHelper,
    ) {
        let mut existing: HashMap<SubchannelId, WatchedSubchannel> = self
            .subchannels
            .drain(..)
            .map(|sc| (id_of(&sc.subchannel), sc))
            .collect();
        let mut seen = HashSet::new();
        for ep in endpoints {
            let id = (ep.address, ep.args);
            if !seen.insert(id.clone()) {
                continue;
            }
            let watched = existing.remove(&id).unwrap_or_else(|| {
                let mut watched = WatchedSubchannel::new(helper.create_subchannel(&id.0, &id.1));
                // Connected to as soon as it reports its initial state.
                watched.state = SubchannelState::connecting();
                watched
            });
            self.subchannels.push(watched);
        }
        debug!(
            "round_robin using {} subchannels, released {}",
            self.subchannels.len(),
            existing.len()
        );
    }

    // Computes the aggregate state and sends it if it differs from the last
    // update, or unconditionally if `force` is set.
    fn send_aggregate_picker(&mut self, helper: &mut dyn ChannelControlHelper, force: bool) {
        let (state, status) = aggregate_subchannel_states(self.subchannels.iter().map(|sc| &sc.state));
        let ready: Vec<Arc<dyn Subchannel>> = self
            .subchannels
            .iter()
            .filter(|sc| sc.state.connectivity_state == ConnectivityState::Ready)
            .map(|sc| sc.subchannel.clone())
            .collect();
        let published = Published {
            state,
            status: status.clone(),
            ready: ready.iter().map(id_of).collect(),
        };
        if !force && self.published.as_ref() == Some(&published) {
            trace!("round_robin state unchanged: {state}");
            return;
        }
        let update = match state {
            ConnectivityState::Ready => StateUpdate::ready(Arc::new(RoundRobinPicker::new(ready))),
            ConnectivityState::TransientFailure => StateUpdate::transient_failure(status),
            // No entry is ever Idle, so neither is the aggregate.
            ConnectivityState::Idle
            | ConnectivityState::Connecting
            | ConnectivityState::Shutdown => StateUpdate::connecting(),
        };
        self.published = Some(published);
        self.last_update = Some(update.clone());
        helper.update_state(update);
    }

    fn move_to_transient_failure(&mut self, helper: &mut dyn ChannelControlHelper, status: Status) {
        self.published = None;
        let update = StateUpdate::transient_failure(status);
        self.last_update = Some(update.clone());
        helper.update_state(update);
        helper.request_reresolution();
    }

    fn republish(&mut self, helper: &mut dyn ChannelControlHelper) {
        match &self.last_update {
            Some(update) => helper.update_state(update.clone()),
            None => self.send_aggregate_picker(helper, true),
        }
    }
}

fn id_of(sc: &Arc<dyn Subchannel>) -> SubchannelId {
    (sc.address().clone(), sc.args().clone())
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: UpdateArgs,
        helper: &mut dyn ChannelControlHelper,
    ) -> Result<(), Status> {
        if let Some(config) = &update.config {
            if config.convert_to::<RoundRobinConfig>().is_none() {
                return Err(Status::invalid_argument(format!(
                    "round_robin: unexpected config for policy {}",
                    config.policy_name()
                )));
            }
        }

        let note = update.resolution_note.as_deref();
        match update.addresses {
            None => {
                self.republish(helper);
                Ok(())
            }
            Some(Ok(endpoints)) => {
                if endpoints.is_empty() {
                    self.subchannels.clear();
                    let status = with_resolution_note(
                        Status::unavailable("received empty address list from the name resolver"),
                        note,
                    );
                    self.move_to_transient_failure(helper, status.clone());
                    return Err(status);
                }
                self.update_subchannels(endpoints, helper);
                self.send_aggregate_picker(helper, true);
                Ok(())
            }
            Some(Err(status)) => {
                debug!("round_robin received resolver error: {status}");
                if self.subchannels.is_empty() {
                    let status = if status.is_ok() {
                        Status::unavailable("resolver error without addresses")
                    } else {
                        status
                    };
                    let status = with_resolution_note(status, note);
                    self.move_to_transient_failure(helper, status.clone());
                    return Err(status);
                }
                // Continue using the previous good update.
                self.republish(helper);
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
        let Some(entry) = self.subchannels.iter_mut().find(|sc| sc.is(&subchannel)) else {
            debug!("round_robin ignoring update for unknown subchannel {subchannel}");
            return;
        };
        trace!("round_robin: {subchannel} reported {:?}", state);
        let previous = entry.state.connectivity_state;
        match state.connectivity_state {
            ConnectivityState::Idle => {
                if previous == ConnectivityState::Ready {
                    helper.request_reresolution();
                }
                subchannel.request_connection();
                if previous != ConnectivityState::TransientFailure {
                    entry.state = SubchannelState::connecting();
                }
            }
            ConnectivityState::Connecting => {
                if previous != ConnectivityState::TransientFailure {
                    entry.state = SubchannelState::connecting();
                }
            }
            ConnectivityState::Ready => entry.state = SubchannelState::ready(),
            ConnectivityState::TransientFailure => {
                entry.state = state.clone();
                helper.request_reresolution();
            }
            ConnectivityState::Shutdown => {}
        }
        self.send_aggregate_picker(helper, false);
    }

    // Idle subchannels are reconnected as soon as they report Idle, so the
    // policy itself is never Idle.
    fn exit_idle(&mut self, _helper: &mut dyn ChannelControlHelper) {}

    fn reset_backoff(&mut self, _helper: &mut dyn ChannelControlHelper) {
        for sc in &self.subchannels {
            sc.subchannel.reset_backoff();
        }
    }

    fn work(&mut self, _helper: &mut dyn ChannelControlHelper) {}

    fn shutdown(&mut self, _helper: &mut dyn ChannelControlHelper) {
        debug!("round_robin shutting down");
        self.subchannels.clear();
        self.published = None;
        self.last_update = None;
    }
}

struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Arc<dyn Subchannel>>) -> Self {
        let random_index: usize = rand::random_range(0..subchannels.len().max(1));
        Self {
            subchannels,
            next: AtomicUsize::new(random_index),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        let len = self.subchannels.len();
        if len == 0 {
            return PickResult::Queue;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % len;
        PickResult::Complete(Pick::new(self.subchannels[idx].clone()))
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::client::load_balancing::test_utils::{
        LbPolicyTest, TestEvent, endpoints, picked_address, tcp_address, verify_connect,
        verify_failed_pick, verify_new_subchannel, verify_no_activity, verify_queued_pick,
        verify_reresolution, verify_state,
    };
    use crate::status::StatusCode;

    type Events = tokio::sync::mpsc::UnboundedReceiver<TestEvent>;

    fn setup() -> (LbPolicyTest, Events) {
        LbPolicyTest::new(&RoundRobinBuilder {})
    }

    fn refused(port: u16) -> SubchannelState {
        SubchannelState::transient_failure(Status::unavailable(format!(
            "connection to port {port} refused"
        )))
    }

    // Sends `addresses` and verifies every subchannel is created and
    // connected, with CONNECTING reported in between.
    async fn connect_all(test: &mut LbPolicyTest, rx: &mut Events, addresses: &[&Address]) {
        test.resolver_update(UpdateArgs::with_addresses(endpoints(addresses)))
            .unwrap();
        for address in addresses {
            verify_new_subchannel(rx, address).await;
        }
        let update = verify_state(rx, ConnectivityState::Connecting).await;
        verify_queued_pick(update.picker.as_ref());
        for address in addresses {
            verify_connect(rx, address).await;
        }
        verify_no_activity(rx);
    }

    #[tokio::test]
    async fn roundrobin_picks_across_ready_subchannels() {
        let (mut test, mut rx) = setup();
        let addresses = [tcp_address(1), tcp_address(2), tcp_address(3)];
        let refs: Vec<&Address> = addresses.iter().collect();
        connect_all(&mut test, &mut rx, &refs).await;

        test.set_subchannel_state(&addresses[0], SubchannelState::ready());
        let update = verify_state(&mut rx, ConnectivityState::Ready).await;
        assert_eq!(picked_address(update.picker.as_ref()), addresses[0]);

        test.set_subchannel_state(&addresses[1], SubchannelState::ready());
        verify_state(&mut rx, ConnectivityState::Ready).await;
        test.set_subchannel_state(&addresses[2], SubchannelState::ready());
        let update = verify_state(&mut rx, ConnectivityState::Ready).await;

        let picks: Vec<Address> = (0..6)
            .map(|_| picked_address(update.picker.as_ref()))
            .collect();
        let mut first_round = picks[..3].to_vec();
        first_round.sort();
        assert_eq!(first_round, addresses.to_vec());
        assert_eq!(picks[..3], picks[3..]);
    }

    #[tokio::test]
    async fn roundrobin_connecting_update_not_repeated() {
        let (mut test, mut rx) = setup();
        let (a1, a2) = (tcp_address(1), tcp_address(2));
        connect_all(&mut test, &mut rx, &[&a1, &a2]).await;
        test.set_subchannel_state(&a1, SubchannelState::connecting());
        test.set_subchannel_state(&a2, SubchannelState::connecting());
        verify_no_activity(&mut rx);
    }

    #[tokio::test]
    async fn roundrobin_transient_failure_is_sticky() {
        let (mut test, mut rx) = setup();
        let (a1, a2) = (tcp_address(1), tcp_address(2));
        connect_all(&mut test, &mut rx, &[&a1, &a2]).await;

        test.set_subchannel_state(&a1, refused(1));
        verify_reresolution(&mut rx).await;
        verify_no_activity(&mut rx);

        test.set_subchannel_state(&a2, refused(2));
        verify_reresolution(&mut rx).await;
        let update = verify_state(&mut rx, ConnectivityState::TransientFailure).await;
        assert_eq!(update.status.code(), StatusCode::Unavailable);
        assert_eq!(
            update.status.message(),
            "connections to all backends failing; last error: connection to port 2 refused"
        );
        let status = verify_failed_pick(update.picker.as_ref());
        assert_eq!(status, update.status);

        // Reconnecting after backoff does not leave TRANSIENT_FAILURE.
        test.set_subchannel_state(&a1, SubchannelState::idle());
        verify_connect(&mut rx, &a1).await;
        test.set_subchannel_state(&a1, SubchannelState::connecting());
        verify_no_activity(&mut rx);

        test.set_subchannel_state(&a1, SubchannelState::ready());
        let update = verify_state(&mut rx, ConnectivityState::Ready).await;
        assert_eq!(picked_address(update.picker.as_ref()), a1);
    }

    #[tokio::test]
    async fn roundrobin_single_failure_reports_its_status() {
        let (mut test, mut rx) = setup();
        let address = tcp_address(1);
        connect_all(&mut test, &mut rx, &[&address]).await;
        test.set_subchannel_state(&address, refused(1));
        verify_reresolution(&mut rx).await;
        let update = verify_state(&mut rx, ConnectivityState::TransientFailure).await;
        assert_eq!(update.status.message(), "connection to port 1 refused");
    }

    #[tokio::test]
    async fn roundrobin_ready_to_idle_reconnects() {
        let (mut test, mut rx) = setup();
        let address = tcp_address(1);
        connect_all(&mut test, &mut rx, &[&address]).await;
        test.set_subchannel_state(&address, SubchannelState::ready());
        verify_state(&mut rx, ConnectivityState::Ready).await;

        test.set_subchannel_state(&address, SubchannelState::idle());
        verify_reresolution(&mut rx).await;
        verify_connect(&mut rx, &address).await;
        let update = verify_state(&mut rx, ConnectivityState::Connecting).await;
        verify_queued_pick(update.picker.as_ref());
    }

    #[tokio::test]
    async fn roundrobin_never_idle() {
        let (mut test, mut rx) = setup();
        let address = tcp_address(1);
        connect_all(&mut test, &mut rx, &[&address]).await;

        test.set_subchannel_state(&address, SubchannelState::idle());
        verify_connect(&mut rx, &address).await;
        verify_no_activity(&mut rx);

        // Nothing is left for exit_idle or the picker's work requests.
        test.exit_idle();
        test.work();
        verify_no_activity(&mut rx);
    }

    #[tokio::test]
    async fn roundrobin_reuses_subchannels() {
        let (mut test, mut rx) = setup();
        let (a1, a2, a3) = (tcp_address(1), tcp_address(2), tcp_address(3));
        connect_all(&mut test, &mut rx, &[&a1, &a2]).await;
        test.set_subchannel_state(&a2, SubchannelState::ready());
        verify_state(&mut rx, ConnectivityState::Ready).await;
        let removed = test.helper.subchannel(&a1).unwrap();

        test.resolver_update(UpdateArgs::with_addresses(endpoints(&[&a2, &a3])))
            .unwrap();
        verify_new_subchannel(&mut rx, &a3).await;
        let update = verify_state(&mut rx, ConnectivityState::Ready).await;
        assert_eq!(picked_address(update.picker.as_ref()), a2);
        verify_connect(&mut rx, &a3).await;
        verify_no_activity(&mut rx);
        assert_eq!(removed.watcher_count(), 0);

        // The same list again creates nothing.
        test.resolver_update(UpdateArgs::with_addresses(endpoints(&[&a2, &a3])))
            .unwrap();
        verify_state(&mut rx, ConnectivityState::Ready).await;
        verify_no_activity(&mut rx);
    }

    #[tokio::test]
    async fn roundrobin_empty_address_list() {
        let (mut test, mut rx) = setup();
        let address = tcp_address(1);
        connect_all(&mut test, &mut rx, &[&address]).await;
        let removed = test.helper.subchannel(&address).unwrap();

        let result = test.resolver_update(UpdateArgs::with_addresses(vec![]));
        assert!(result.is_err());
        let update = verify_state(&mut rx, ConnectivityState::TransientFailure).await;
        verify_failed_pick(update.picker.as_ref());
        verify_reresolution(&mut rx).await;
        assert_eq!(removed.watcher_count(), 0);
    }

    #[tokio::test]
    async fn roundrobin_resolver_error() {
        let (mut test, mut rx) = setup();
        let result = test.resolver_update(UpdateArgs::with_error(Status::unavailable(
            "dns lookup failed",
        )));
        assert_eq!(result.unwrap_err().message(), "dns lookup failed");
        let update = verify_state(&mut rx, ConnectivityState::TransientFailure).await;
        assert_eq!(update.status.message(), "dns lookup failed");
        verify_reresolution(&mut rx).await;

        // With subchannels the previous state is kept.
        let address = tcp_address(1);
        connect_all(&mut test, &mut rx, &[&address]).await;
        test.resolver_update(UpdateArgs::with_error(Status::unavailable(
            "dns lookup failed",
        )))
        .unwrap();
        verify_state(&mut rx, ConnectivityState::Connecting).await;
    }

    #[tokio::test]
    async fn roundrobin_shutdown_cancels_watches() {
        let (mut test, mut rx) = setup();
        let (a1, a2) = (tcp_address(1), tcp_address(2));
        connect_all(&mut test, &mut rx, &[&a1, &a2]).await;
        let subchannels = [
            test.helper.subchannel(&a1).unwrap(),
            test.helper.subchannel(&a2).unwrap(),
        ];
        test.shutdown();
        assert!(subchannels.iter().all(|sc| sc.watcher_count() == 0));
        subchannels[1].set_state(SubchannelState::ready());
        test.deliver_subchannel_events();
        verify_no_activity(&mut rx);
    }

    #[tokio::test]
    async fn roundrobin_rejects_foreign_config() {
        let (mut test, mut rx) = setup();
        let result = test.resolver_update(
            UpdateArgs::with_addresses(endpoints(&[&tcp_address(1)]))
                .config(Some(LbConfig::new("pick_first", ()))),
        );
        assert_eq!(result.unwrap_err().code(), StatusCode::InvalidArgument);
        verify_no_activity(&mut rx);
    }

    #[test]
    fn roundrobin_parse_config() {
        let builder = RoundRobinBuilder {};
        let config = builder
            .parse_config(&ParsedJsonLbConfig::new(json!({})))
            .unwrap()
            .unwrap();
        assert_eq!(config.policy_name(), POLICY_NAME);
        assert!(config.convert_to::<RoundRobinConfig>().is_some());
        assert!(
            builder
                .parse_config(&ParsedJsonLbConfig::new(json!("fast")))
                .is_err()
        );
    }
}
