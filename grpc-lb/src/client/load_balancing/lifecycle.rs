use std::sync::Arc;

use tracing::{debug, error};

use crate::client::channel_args::ChannelArgs;
use crate::client::load_balancing::{
    ChannelControlHelper, LbPolicy, StateUpdate, Subchannel, SubchannelState, TraceSeverity,
};
use crate::client::name_resolution::{Address, UpdateArgs};
use crate::rt::Runtime;
use crate::status::Status;

/// The lifecycle stage of a managed LB policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    ShuttingDown,
    ShutDown,
}

/// Owns an LB policy on behalf of the channel.
///
/// Guarantees that `shutdown` reaches the policy exactly once, that no other
/// method reaches it afterwards, and that state updates the policy publishes
/// from within its own shutdown are discarded.
pub struct ManagedPolicy {
    name: String,
    policy: Box<dyn LbPolicy>,
    lifecycle: Lifecycle,
}

impl ManagedPolicy {
    pub fn new(name: impl Into<String>, policy: Box<dyn LbPolicy>) -> Self {
        ManagedPolicy {
            name: name.into(),
            policy,
            lifecycle: Lifecycle::Active,
        }
    }

    /// The registered name of the managed policy.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn resolver_update(
        &mut self,
        update: UpdateArgs,
        helper: &mut dyn ChannelControlHelper,
    ) -> Result<(), Status> {
        if !self.is_active() {
            debug!("dropping resolver update for {} policy after shutdown", self.name);
            return Err(Status::unavailable(format!(
                "{} policy is shut down",
                self.name
            )));
        }
        let mut helper = GuardedHelper::new(helper, &self.name, true);
        self.policy.resolver_update(update, &mut helper)
    }

    pub fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        helper: &mut dyn ChannelControlHelper,
    ) {
        if !self.is_active() {
            return;
        }
        let mut helper = GuardedHelper::new(helper, &self.name, true);
        self.policy.subchannel_update(subchannel, state, &mut helper);
    }

    pub fn exit_idle(&mut self, helper: &mut dyn ChannelControlHelper) {
        if !self.is_active() {
            return;
        }
        let mut helper = GuardedHelper::new(helper, &self.name, true);
        self.policy.exit_idle(&mut helper);
    }

    pub fn reset_backoff(&mut self, helper: &mut dyn ChannelControlHelper) {
        if !self.is_active() {
            return;
        }
        let mut helper = GuardedHelper::new(helper, &self.name, true);
        self.policy.reset_backoff(&mut helper);
    }

    pub fn work(&mut self, helper: &mut dyn ChannelControlHelper) {
        if !self.is_active() {
            return;
        }
        let mut helper = GuardedHelper::new(helper, &self.name, true);
        self.policy.work(&mut helper);
    }

    /// Shuts the policy down. Only the first call reaches the policy.
    pub fn shutdown(&mut self, helper: &mut dyn ChannelControlHelper) {
        if !self.is_active() {
            return;
        }
        debug!("shutting down {} policy", self.name);
        self.lifecycle = Lifecycle::ShuttingDown;
        let mut helper = GuardedHelper::new(helper, &self.name, false);
        self.policy.shutdown(&mut helper);
        self.lifecycle = Lifecycle::ShutDown;
    }
}

/// Wraps the channel's helper for the duration of one policy call.
///
/// Invalid state updates are rejected. When inactive, state updates are
/// discarded entirely.
pub(crate) struct GuardedHelper<'a> {
    inner: &'a mut dyn ChannelControlHelper,
    name: &'a str,
    active: bool,
}

impl<'a> GuardedHelper<'a> {
    pub(crate) fn new(inner: &'a mut dyn ChannelControlHelper, name: &'a str, active: bool) -> Self {
        GuardedHelper {
            inner,
            name,
            active,
        }
    }
}

impl ChannelControlHelper for GuardedHelper<'_> {
    fn create_subchannel(&mut self, address: &Address, args: &ChannelArgs) -> Arc<dyn Subchannel> {
        self.inner.create_subchannel(address, args)
    }

    fn update_state(&mut self, update: StateUpdate) {
        if !self.active {
            debug!(
                "discarding {} update from {} policy during shutdown",
                update.connectivity_state, self.name
            );
            return;
        }
        if let Err(err) = update.validate() {
            error!("{} policy published an invalid update: {err}", self.name);
            debug_assert!(false, "invalid update from {} policy: {err}", self.name);
            return;
        }
        self.inner.update_state(update);
    }

    fn request_reresolution(&mut self) {
        self.inner.request_reresolution();
    }

    fn authority(&self) -> &str {
        self.inner.authority()
    }

    fn runtime(&self) -> Arc<dyn Runtime> {
        self.inner.runtime()
    }

    fn add_trace_event(&mut self, severity: TraceSeverity, message: &str) {
        self.inner.add_trace_event(severity, message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::client::ConnectivityState;
    use crate::client::load_balancing::test_utils::{self, TestEvent};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        ResolverUpdate,
        ExitIdle,
        ResetBackoff,
        Work,
        Shutdown,
    }

    // Records every call and publishes `on_shutdown` from within shutdown.
    struct RecordingPolicy {
        calls: Arc<Mutex<Vec<Call>>>,
        on_shutdown: Option<StateUpdate>,
    }

    impl LbPolicy for RecordingPolicy {
        fn resolver_update(
            &mut self,
            _update: UpdateArgs,
            helper: &mut dyn ChannelControlHelper,
        ) -> Result<(), Status> {
            self.calls.lock().unwrap().push(Call::ResolverUpdate);
            helper.update_state(StateUpdate::connecting());
            Ok(())
        }

        fn subchannel_update(
            &mut self,
            _subchannel: Arc<dyn Subchannel>,
            _state: &SubchannelState,
            _helper: &mut dyn ChannelControlHelper,
        ) {
        }

        fn exit_idle(&mut self, _helper: &mut dyn ChannelControlHelper) {
            self.calls.lock().unwrap().push(Call::ExitIdle);
        }

        fn reset_backoff(&mut self, _helper: &mut dyn ChannelControlHelper) {
            self.calls.lock().unwrap().push(Call::ResetBackoff);
        }

        fn work(&mut self, _helper: &mut dyn ChannelControlHelper) {
            self.calls.lock().unwrap().push(Call::Work);
        }

        fn shutdown(&mut self, helper: &mut dyn ChannelControlHelper) {
            self.calls.lock().unwrap().push(Call::Shutdown);
            if let Some(update) = self.on_shutdown.take() {
                helper.update_state(update);
            }
        }
    }

    fn setup() -> (
        ManagedPolicy,
        Arc<Mutex<Vec<Call>>>,
        test_utils::FakeHelper,
        tokio::sync::mpsc::UnboundedReceiver<TestEvent>,
    ) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let policy = ManagedPolicy::new(
            "recording",
            Box::new(RecordingPolicy {
                calls: calls.clone(),
                on_shutdown: Some(StateUpdate::connecting()),
            }),
        );
        let (helper, rx) = test_utils::FakeHelper::new();
        (policy, calls, helper, rx)
    }

    #[tokio::test]
    async fn test_shutdown_reaches_policy_once() {
        let (mut policy, calls, mut helper, mut rx) = setup();
        assert_eq!(policy.lifecycle(), Lifecycle::Active);
        policy.shutdown(&mut helper);
        policy.shutdown(&mut helper);
        assert_eq!(policy.lifecycle(), Lifecycle::ShutDown);
        assert_eq!(*calls.lock().unwrap(), vec![Call::Shutdown]);
        // The update published during shutdown was discarded.
        test_utils::verify_no_activity(&mut rx);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_ignored() {
        let (mut policy, calls, mut helper, mut rx) = setup();
        policy.shutdown(&mut helper);
        assert!(
            policy
                .resolver_update(UpdateArgs::with_addresses(vec![]), &mut helper)
                .is_err()
        );
        policy.exit_idle(&mut helper);
        policy.reset_backoff(&mut helper);
        policy.work(&mut helper);
        assert_eq!(*calls.lock().unwrap(), vec![Call::Shutdown]);
        test_utils::verify_no_activity(&mut rx);
    }

    #[tokio::test]
    async fn test_active_policy_forwards_calls() {
        let (mut policy, calls, mut helper, mut rx) = setup();
        policy
            .resolver_update(UpdateArgs::with_addresses(vec![]), &mut helper)
            .unwrap();
        policy.exit_idle(&mut helper);
        policy.reset_backoff(&mut helper);
        policy.work(&mut helper);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                Call::ResolverUpdate,
                Call::ExitIdle,
                Call::ResetBackoff,
                Call::Work
            ]
        );
        let update = test_utils::verify_update_state(&mut rx).await;
        assert_eq!(update.connectivity_state, ConnectivityState::Connecting);
    }

    #[tokio::test]
    #[cfg_attr(debug_assertions, should_panic(expected = "invalid update"))]
    async fn test_invalid_update_rejected() {
        let (mut helper, mut rx) = test_utils::FakeHelper::new();
        let mut guarded = GuardedHelper::new(&mut helper, "test", true);
        guarded.update_state(StateUpdate::new(
            ConnectivityState::TransientFailure,
            Status::ok(),
            Arc::new(crate::client::load_balancing::QueuingPicker {}),
        ));
        test_utils::verify_no_activity(&mut rx);
    }
}
