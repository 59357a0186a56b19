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

use thiserror::Error;

use crate::status::{Status, StatusCode};

/// Errors produced by the load balancing framework itself.
///
/// Connectivity problems are never reported through this type; they surface
/// as `TransientFailure` states carrying a [`Status`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LbError {
    /// No builder is registered under the requested policy name.
    #[error("no LB policy registered with name {0:?}")]
    PolicyNotFound(String),
    /// A policy rejected its configuration.
    #[error("invalid config for LB policy {policy:?}: {reason}")]
    InvalidConfig { policy: String, reason: String },
    /// Work was submitted to a serializer that has been shut down.
    #[error("work serializer is shut down")]
    SerializerClosed,
    /// An address URI could not be parsed.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

impl LbError {
    pub(crate) fn invalid_config(policy: impl Into<String>, reason: impl ToString) -> Self {
        LbError::InvalidConfig {
            policy: policy.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<LbError> for Status {
    fn from(err: LbError) -> Self {
        let code = match &err {
            LbError::PolicyNotFound(_)
            | LbError::InvalidConfig { .. }
            | LbError::InvalidAddress { .. } => StatusCode::InvalidArgument,
            LbError::SerializerClosed => StatusCode::Unavailable,
        };
        Status::new(code, err.to_string())
    }
}
