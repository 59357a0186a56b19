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

use tokio::sync::oneshot;

use crate::client::channel_args::ChannelArgs;
use crate::client::name_resolution::Address;
use crate::rt::BoxFuture;

/// An established connection to a backend.
///
/// The load balancing core only needs to learn when the connection goes
/// away. The transport completes `disconnection_listener` (or drops its
/// sender) once the connection is closed, with an error if it closed
/// abnormally.
pub struct ConnectedTransport {
    pub disconnection_listener: oneshot::Receiver<Result<(), String>>,
}

/// Establishes connections on behalf of subchannels.
pub trait Transport: Send + Sync {
    /// Connects to `address`. `args` are the subchannel's channel arguments.
    /// Errors are reported as a human readable description.
    fn connect(
        &self,
        address: &Address,
        args: &ChannelArgs,
    ) -> BoxFuture<Result<ConnectedTransport, String>>;
}
