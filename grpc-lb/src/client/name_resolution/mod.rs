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

//! The boundary between name resolution and load balancing.
//!
//! Resolution itself is performed elsewhere. The load balancing core only
//! consumes its results as [`UpdateArgs`] and asks for fresh results through a
//! [`ResolutionRequester`].

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;

use url::Url;

use crate::client::channel_args::ChannelArgs;
use crate::client::service_config::LbConfig;
use crate::error::LbError;
use crate::status::Status;

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

/// Indicates the address is a filesystem path of a unix domain socket.
pub static UNIX_NETWORK_TYPE: &str = "unix";

/// An Address is an identifier that indicates how to connect to a server.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,
}

impl Address {
    pub fn new(network_type: &'static str, address: impl Into<String>) -> Self {
        Address {
            network_type,
            address: address.into(),
        }
    }

    /// A TCP/IP address for the given socket address.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(TCP_IP_NETWORK_TYPE, addr.to_string())
    }

    /// Parses a single address URI: `ipv4:1.2.3.4:443`, `ipv6:[::1]:443`,
    /// `unix:/path/to/socket` or `unix:///path/to/socket`.
    pub fn from_uri(uri: &str) -> Result<Self, LbError> {
        let mut addrs = parse_address_uri(uri)?;
        if addrs.len() != 1 {
            return Err(invalid(uri, "expected exactly one address"));
        }
        Ok(addrs.remove(0))
    }

    /// Formats the address back into its URI form.
    pub fn to_uri(&self) -> String {
        if self.network_type == UNIX_NETWORK_TYPE {
            return format!("unix:{}", self.address);
        }
        match self.address.parse::<SocketAddr>() {
            Ok(SocketAddr::V4(_)) => format!("ipv4:{}", self.address),
            Ok(SocketAddr::V6(_)) => format!("ipv6:{}", self.address),
            Err(_) => format!("{}:{}", self.network_type, self.address),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

fn invalid(uri: &str, reason: impl ToString) -> LbError {
    LbError::InvalidAddress {
        address: uri.to_string(),
        reason: reason.to_string(),
    }
}

/// Parses an address URI which may list several comma separated addresses of
/// the same scheme, e.g. `ipv4:10.0.0.1:443,10.0.0.2:443`.
pub fn parse_address_uri(uri: &str) -> Result<Vec<Address>, LbError> {
    let url = Url::parse(uri).map_err(|e| invalid(uri, e))?;
    let body = url.path();
    if body.is_empty() {
        return Err(invalid(uri, "missing address"));
    }
    match url.scheme() {
        "ipv4" | "ipv6" => {
            let want_v4 = url.scheme() == "ipv4";
            body.split(',')
                .map(|part| {
                    let addr: SocketAddr = part.parse().map_err(|e| invalid(uri, e))?;
                    if addr.is_ipv4() != want_v4 {
                        return Err(invalid(
                            uri,
                            format!("{part} does not match scheme {}", url.scheme()),
                        ));
                    }
                    Ok(Address::tcp(addr))
                })
                .collect()
        }
        "unix" => Ok(vec![Address::new(UNIX_NETWORK_TYPE, body)]),
        scheme => Err(invalid(uri, format!("unsupported scheme {scheme:?}"))),
    }
}

/// A resolved address together with the per-address arguments the resolver
/// attached to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointAddress {
    pub address: Address,
    pub args: ChannelArgs,
}

impl EndpointAddress {
    pub fn new(address: Address) -> Self {
        EndpointAddress {
            address,
            args: ChannelArgs::default(),
        }
    }

    pub fn with_args(address: Address, args: ChannelArgs) -> Self {
        EndpointAddress { address, args }
    }
}

impl From<Address> for EndpointAddress {
    fn from(address: Address) -> Self {
        EndpointAddress::new(address)
    }
}

/// The input to an LB policy: the result of name resolution plus the policy's
/// parsed configuration.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct UpdateArgs {
    /// The resolved addresses. `None` means the address list is unchanged
    /// since the previous update; `Some(Err(_))` means resolution failed.
    pub addresses: Option<Result<Vec<EndpointAddress>, Status>>,

    /// The policy's configuration, if one was provided.
    pub config: Option<LbConfig>,

    /// Optional text describing the outcome of resolution, appended to error
    /// messages produced by the policy.
    pub resolution_note: Option<String>,
}

impl UpdateArgs {
    pub fn with_addresses(addresses: Vec<EndpointAddress>) -> Self {
        UpdateArgs {
            addresses: Some(Ok(addresses)),
            ..Default::default()
        }
    }

    pub fn with_error(status: Status) -> Self {
        UpdateArgs {
            addresses: Some(Err(status)),
            ..Default::default()
        }
    }

    pub fn config(mut self, config: Option<LbConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn resolution_note(mut self, note: impl Into<String>) -> Self {
        self.resolution_note = Some(note.into());
        self
    }
}

/// Allows the load balancing side to ask the resolver for a fresh result.
pub trait ResolutionRequester: Send + Sync {
    /// Requests re-resolution. The resolver may coalesce or ignore requests.
    fn request_resolution(&self);
}
