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

//! Client-side load balancing for [gRPC] channels.
//!
//! The crate decides, for every outgoing call, which backend connection
//! ("subchannel") to use. It tracks the connectivity state of each
//! connection, lets pluggable load balancing policies aggregate those states
//! into a channel state, and publishes pickers which route calls without
//! blocking.
//!
//! The entry point is [`client::LbChannel`]. Policies implement
//! [`client::load_balancing::LbPolicy`] and are registered with an
//! [`client::load_balancing::LbPolicyRegistry`]; `pick_first` and
//! `round_robin` are bundled.
//!
//! This version is in progress and not recommended for any production use.  All
//! APIs are unstable.  Proceed at your own risk.
//!
//! [gRPC]: https://grpc.io

pub mod client;
pub mod error;
pub mod rt;
pub mod status;

pub use error::LbError;
pub use status::{Status, StatusCode};
