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

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::metadata::MetadataMap;

use crate::client::ConnectivityState;
use crate::client::channel_args::ChannelArgs;
use crate::client::connectivity_state::ConnectivityStateTracker;
use crate::client::load_balancing::{
    CallState, ChannelControlHelper, LbPolicy, LbPolicyBuilder, LbPolicyOptions, PickArgs,
    PickResult, Picker, StateUpdate, Subchannel, SubchannelEvent, SubchannelState, TraceSeverity,
    WatchHandle, WorkScheduler,
};
use crate::client::name_resolution::{Address, EndpointAddress, UpdateArgs};
use crate::client::subchannel::{SubchannelEventSink, cancel_tracker_watch, watch_tracker};
use crate::rt::{self, Runtime};
use crate::status::Status;

pub(crate) const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const TEST_AUTHORITY: &str = "server.example.com";

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdateState(StateUpdate),
    RequestReresolution,
    Connect(Address),
    ResetBackoff(Address),
    ScheduleWork,
    Trace(TraceSeverity, String),
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdateState(update) => write!(
                f,
                "UpdateState({}, {})",
                update.connectivity_state, update.status
            ),
            Self::RequestReresolution => write!(f, "RequestReresolution"),
            Self::Connect(addr) => write!(f, "Connect({addr})"),
            Self::ResetBackoff(addr) => write!(f, "ResetBackoff({addr})"),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
            Self::Trace(severity, msg) => write!(f, "Trace({severity:?}, {msg})"),
        }
    }
}

// A test subchannel whose connectivity state is driven by the test. Connect
// and backoff requests are forwarded to the event channel so tests can verify
// them.
pub(crate) struct FakeSubchannel {
    address: Address,
    args: ChannelArgs,
    tracker: ConnectivityStateTracker,
    tx_events: mpsc::UnboundedSender<TestEvent>,
    sink: SubchannelEventSink,
    me: Weak<FakeSubchannel>,
}

impl FakeSubchannel {
    fn new(
        address: Address,
        args: ChannelArgs,
        tx_events: mpsc::UnboundedSender<TestEvent>,
        sink: SubchannelEventSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| FakeSubchannel {
            tracker: ConnectivityStateTracker::new(
                format!("fake subchannel {address}"),
                ConnectivityState::Idle,
                Status::ok(),
            ),
            address,
            args,
            tx_events,
            sink,
            me: me.clone(),
        })
    }

    pub(crate) fn set_state(&self, state: SubchannelState) {
        self.tracker
            .set_state(state.connectivity_state, state.status, "set by test");
    }

    pub(crate) fn watcher_count(&self) -> usize {
        self.tracker.watcher_count()
    }
}

impl Subchannel for FakeSubchannel {
    fn address(&self) -> &Address {
        &self.address
    }

    fn args(&self) -> &ChannelArgs {
        &self.args
    }

    fn watch_connectivity_state(&self) -> WatchHandle {
        let me: Weak<dyn Subchannel> = self.me.clone();
        watch_tracker(&self.tracker, me, self.sink.clone())
    }

    fn cancel_connectivity_state_watch(&self, handle: &WatchHandle) {
        cancel_tracker_watch(&self.tracker, handle);
    }

    fn request_connection(&self) {
        self.tx_events
            .send(TestEvent::Connect(self.address.clone()))
            .unwrap();
    }

    fn reset_backoff(&self) {
        self.tx_events
            .send(TestEvent::ResetBackoff(self.address.clone()))
            .unwrap();
    }
}

/// A test helper that forwards calls to a channel.  This allows tests to
/// verify when a policy creates subchannels or publishes state.
///
/// Subchannel events are queued and only handed to a policy when the test
/// asks for them, in the same way the channel's serializer does.
pub(crate) struct FakeHelper {
    tx_events: mpsc::UnboundedSender<TestEvent>,
    sink: SubchannelEventSink,
    rx_subchannel_events: mpsc::UnboundedReceiver<SubchannelEvent>,
    subchannels: HashMap<Address, Weak<FakeSubchannel>>,
    runtime: Arc<dyn Runtime>,
}

impl FakeHelper {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<TestEvent>) {
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let (tx_subchannel_events, rx_subchannel_events) = mpsc::unbounded_channel();
        let sink: SubchannelEventSink = Arc::new(move |event| {
            let _ = tx_subchannel_events.send(event);
        });
        let helper = FakeHelper {
            tx_events,
            sink,
            rx_subchannel_events,
            subchannels: HashMap::new(),
            runtime: rt::default_runtime(),
        };
        (helper, rx_events)
    }

    pub(crate) fn tx_events(&self) -> mpsc::UnboundedSender<TestEvent> {
        self.tx_events.clone()
    }

    /// The most recently created, still alive subchannel for `address`.
    pub(crate) fn subchannel(&self, address: &Address) -> Option<Arc<FakeSubchannel>> {
        self.subchannels.get(address).and_then(Weak::upgrade)
    }

    pub(crate) fn take_subchannel_event(&mut self) -> Option<SubchannelEvent> {
        self.rx_subchannel_events.try_recv().ok()
    }
}

impl ChannelControlHelper for FakeHelper {
    fn create_subchannel(&mut self, address: &Address, args: &ChannelArgs) -> Arc<dyn Subchannel> {
        let subchannel = FakeSubchannel::new(
            address.clone(),
            args.clone(),
            self.tx_events.clone(),
            self.sink.clone(),
        );
        self.subchannels
            .insert(address.clone(), Arc::downgrade(&subchannel));
        let subchannel: Arc<dyn Subchannel> = subchannel;
        self.tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()))
            .unwrap();
        subchannel
    }

    fn update_state(&mut self, update: StateUpdate) {
        self.tx_events.send(TestEvent::UpdateState(update)).unwrap();
    }

    fn request_reresolution(&mut self) {
        self.tx_events.send(TestEvent::RequestReresolution).unwrap();
    }

    fn authority(&self) -> &str {
        TEST_AUTHORITY
    }

    fn runtime(&self) -> Arc<dyn Runtime> {
        self.runtime.clone()
    }

    fn add_trace_event(&mut self, severity: TraceSeverity, message: &str) {
        self.tx_events
            .send(TestEvent::Trace(severity, message.to_string()))
            .unwrap();
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        self.tx_events.send(TestEvent::ScheduleWork).unwrap();
    }
}

struct NoopWorkScheduler;

impl WorkScheduler for NoopWorkScheduler {
    fn schedule_work(&self) {}
}

pub(crate) fn lb_policy_options() -> LbPolicyOptions {
    LbPolicyOptions::new(
        Arc::new(NoopWorkScheduler),
        rt::default_runtime(),
        TEST_AUTHORITY,
    )
}

/// Drives a single LB policy against a [`FakeHelper`].
pub(crate) struct LbPolicyTest {
    pub(crate) policy: Box<dyn LbPolicy>,
    pub(crate) helper: FakeHelper,
}

impl LbPolicyTest {
    pub(crate) fn new(builder: &dyn LbPolicyBuilder) -> (Self, mpsc::UnboundedReceiver<TestEvent>) {
        let (helper, rx_events) = FakeHelper::new();
        let options = LbPolicyOptions::new(
            Arc::new(TestWorkScheduler {
                tx_events: helper.tx_events(),
            }),
            rt::default_runtime(),
            TEST_AUTHORITY,
        );
        let policy = builder.build(options);
        (LbPolicyTest { policy, helper }, rx_events)
    }

    /// Sends `update` to the policy and then delivers the resulting
    /// subchannel events.
    pub(crate) fn resolver_update(&mut self, update: UpdateArgs) -> Result<(), Status> {
        let result = self.policy.resolver_update(update, &mut self.helper);
        self.deliver_subchannel_events();
        result
    }

    /// Moves the subchannel for `address` to `state` and delivers it to the
    /// policy.
    pub(crate) fn set_subchannel_state(&mut self, address: &Address, state: SubchannelState) {
        let subchannel = self
            .helper
            .subchannel(address)
            .unwrap_or_else(|| panic!("no subchannel for {address}"));
        subchannel.set_state(state);
        self.deliver_subchannel_events();
    }

    pub(crate) fn work(&mut self) {
        self.policy.work(&mut self.helper);
        self.deliver_subchannel_events();
    }

    pub(crate) fn exit_idle(&mut self) {
        self.policy.exit_idle(&mut self.helper);
        self.deliver_subchannel_events();
    }

    pub(crate) fn reset_backoff(&mut self) {
        self.policy.reset_backoff(&mut self.helper);
    }

    pub(crate) fn shutdown(&mut self) {
        self.policy.shutdown(&mut self.helper);
        self.deliver_subchannel_events();
    }

    /// Hands every queued subchannel event to the policy, skipping events of
    /// cancelled watches.
    pub(crate) fn deliver_subchannel_events(&mut self) {
        while let Some(event) = self.helper.take_subchannel_event() {
            if event.is_active() {
                self.policy
                    .subchannel_update(event.subchannel.clone(), &event.state, &mut self.helper);
            }
        }
    }
}

pub(crate) fn endpoints(addresses: &[&Address]) -> Vec<EndpointAddress> {
    addresses
        .iter()
        .map(|a| EndpointAddress::new((*a).clone()))
        .collect()
}

pub(crate) fn tcp_address(port: u16) -> Address {
    Address::new("tcp", format!("127.0.0.1:{port}"))
}

pub(crate) fn pick(picker: &dyn Picker) -> PickResult {
    let metadata = MetadataMap::new();
    let mut call_state = CallState::new();
    picker.pick(PickArgs {
        path: "/test.Service/Method",
        metadata: &metadata,
        call_state: &mut call_state,
    })
}

/// Returns the address of the subchannel the picker completes the pick with.
pub(crate) fn picked_address(picker: &dyn Picker) -> Address {
    match pick(picker) {
        PickResult::Complete(pick) => pick.subchannel.address().clone(),
        other => panic!("unexpected pick result {other}"),
    }
}

pub(crate) fn verify_queued_pick(picker: &dyn Picker) {
    let result = pick(picker);
    assert!(result.is_queue(), "unexpected pick result {result}");
}

pub(crate) fn verify_failed_pick(picker: &dyn Picker) -> Status {
    match pick(picker) {
        PickResult::Fail(status) => status,
        other => panic!("unexpected pick result {other}"),
    }
}

/// Waits for the next event other than a trace event.
pub(crate) async fn next_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
    loop {
        let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        if !matches!(event, TestEvent::Trace(..)) {
            return event;
        }
    }
}

pub(crate) async fn verify_new_subchannel(
    rx: &mut mpsc::UnboundedReceiver<TestEvent>,
    address: &Address,
) -> Arc<dyn Subchannel> {
    match next_event(rx).await {
        TestEvent::NewSubchannel(sc) => {
            assert_eq!(sc.address(), address);
            sc
        }
        other => panic!("unexpected event {other:?}"),
    }
}

pub(crate) async fn verify_connect(rx: &mut mpsc::UnboundedReceiver<TestEvent>, address: &Address) {
    match next_event(rx).await {
        TestEvent::Connect(addr) => assert_eq!(&addr, address),
        other => panic!("unexpected event {other:?}"),
    }
}

pub(crate) async fn verify_update_state(
    rx: &mut mpsc::UnboundedReceiver<TestEvent>,
) -> StateUpdate {
    match next_event(rx).await {
        TestEvent::UpdateState(update) => update,
        other => panic!("unexpected event {other:?}"),
    }
}

/// Waits for a state update and checks its connectivity state.
pub(crate) async fn verify_state(
    rx: &mut mpsc::UnboundedReceiver<TestEvent>,
    state: ConnectivityState,
) -> StateUpdate {
    let update = verify_update_state(rx).await;
    assert_eq!(update.connectivity_state, state, "unexpected {update:?}");
    update
}

pub(crate) async fn verify_reresolution(rx: &mut mpsc::UnboundedReceiver<TestEvent>) {
    match next_event(rx).await {
        TestEvent::RequestReresolution => {}
        other => panic!("unexpected event {other:?}"),
    }
}

pub(crate) async fn verify_schedule_work(rx: &mut mpsc::UnboundedReceiver<TestEvent>) {
    match next_event(rx).await {
        TestEvent::ScheduleWork => {}
        other => panic!("unexpected event {other:?}"),
    }
}

/// Checks that nothing but trace events were recorded.
pub(crate) fn verify_no_activity(rx: &mut mpsc::UnboundedReceiver<TestEvent>) {
    while let Ok(event) = rx.try_recv() {
        if !matches!(event, TestEvent::Trace(..)) {
            panic!("unexpected event {event:?}");
        }
    }
}

/// A policy which records the calls it receives and publishes Connecting in
/// response to every resolver update.
pub(crate) struct StubPolicy {
    name: &'static str,
    calls: Arc<Mutex<Vec<String>>>,
}

impl LbPolicy for StubPolicy {
    fn resolver_update(
        &mut self,
        update: UpdateArgs,
        helper: &mut dyn ChannelControlHelper,
    ) -> Result<(), Status> {
        let count = match &update.addresses {
            Some(Ok(addresses)) => addresses.len(),
            _ => 0,
        };
        self.record(format!("resolver_update({count})"));
        helper.update_state(StateUpdate::connecting());
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        _helper: &mut dyn ChannelControlHelper,
    ) {
        self.record(format!(
            "subchannel_update({subchannel}, {})",
            state.connectivity_state
        ));
    }

    fn exit_idle(&mut self, _helper: &mut dyn ChannelControlHelper) {
        self.record("exit_idle".to_string());
    }

    fn reset_backoff(&mut self, _helper: &mut dyn ChannelControlHelper) {
        self.record("reset_backoff".to_string());
    }

    fn work(&mut self, _helper: &mut dyn ChannelControlHelper) {
        self.record("work".to_string());
    }

    fn shutdown(&mut self, _helper: &mut dyn ChannelControlHelper) {
        self.record("shutdown".to_string());
    }
}

impl StubPolicy {
    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}: {call}", self.name));
    }
}

/// This StubPolicyBuilder builds a StubPolicy. All policies built share the
/// builder's call log.
pub(crate) struct StubPolicyBuilder {
    name: &'static str,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StubPolicyBuilder {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: Arc::default(),
        }
    }

    /// A builder recording into an existing call log, so that the calls of
    /// several policies can be observed in order.
    pub(crate) fn with_log(name: &'static str, calls: Arc<Mutex<Vec<String>>>) -> Self {
        Self { name, calls }
    }

    pub(crate) fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }
}

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(StubPolicy {
            name: self.name,
            calls: self.calls.clone(),
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
