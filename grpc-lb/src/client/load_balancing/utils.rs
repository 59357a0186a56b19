use std::sync::Arc;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{Subchannel, SubchannelState, WatchHandle};
use crate::status::Status;

/// Aggregates the states of a set of subchannels.
///
/// If any subchannel is READY then we consider the aggregate state to be
/// READY. Otherwise, if any subchannel is CONNECTING, then report CONNECTING.
/// Otherwise, if any subchannel is IDLE, then report IDLE. Report TRANSIENT
/// FAILURE if no conditions above apply, including when there are no
/// subchannels at all. SHUTDOWN subchannels are not considered.
pub fn aggregate_subchannel_states<'a>(
    states: impl IntoIterator<Item = &'a SubchannelState>,
) -> (ConnectivityState, Status) {
    let mut is_connecting = false;
    let mut is_idle = false;
    let mut failures = 0;
    let mut last_error = None;

    for state in states {
        match state.connectivity_state {
            ConnectivityState::Ready => return (ConnectivityState::Ready, Status::ok()),
            ConnectivityState::Connecting => is_connecting = true,
            ConnectivityState::Idle => is_idle = true,
            ConnectivityState::TransientFailure => {
                failures += 1;
                last_error = Some(&state.status);
            }
            ConnectivityState::Shutdown => {}
        }
    }

    if is_connecting {
        return (ConnectivityState::Connecting, Status::ok());
    }
    if is_idle {
        return (ConnectivityState::Idle, Status::ok());
    }
    let status = match last_error {
        None => Status::unavailable("no subchannels available"),
        Some(last) if failures == 1 => last.clone(),
        Some(last) => last.with_context("connections to all backends failing; last error"),
    };
    (ConnectivityState::TransientFailure, status)
}

/// Appends the resolver's note to a status describing a resolution problem.
pub fn with_resolution_note(status: Status, note: Option<&str>) -> Status {
    match note {
        Some(note) if !note.is_empty() => {
            Status::new(status.code(), format!("{} ({note})", status.message()))
        }
        _ => status,
    }
}

/// A subchannel together with the watch a policy holds on it and the last
/// state it reported. Dropping it cancels the watch.
pub struct WatchedSubchannel {
    pub subchannel: Arc<dyn Subchannel>,
    pub state: SubchannelState,
    watch: WatchHandle,
}

impl WatchedSubchannel {
    /// Starts watching `subchannel`. Its state is Idle until the first event
    /// arrives.
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        let watch = subchannel.watch_connectivity_state();
        WatchedSubchannel {
            subchannel,
            state: SubchannelState::idle(),
            watch,
        }
    }

    pub fn watch(&self) -> &WatchHandle {
        &self.watch
    }

    /// Reports whether this entry tracks `subchannel`.
    pub fn is(&self, subchannel: &Arc<dyn Subchannel>) -> bool {
        crate::client::load_balancing::same_subchannel(&self.subchannel, subchannel)
    }
}

impl Drop for WatchedSubchannel {
    fn drop(&mut self) {
        self.subchannel.cancel_connectivity_state_watch(&self.watch);
    }
}
