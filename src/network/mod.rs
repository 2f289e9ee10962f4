//! Network layer for Mitmock
//!
//! In-process connection hijacking for hyper clients: intercepted
//! connections are served by a local HTTP/1 server, bypassed ones dial the
//! real network.

mod client;
mod hijack;
mod observer;
mod request;
mod response;
mod stream;

pub use client::{ForwardRequest, ForwardedResponse, UpstreamClient};
pub use hijack::{
    ConnectOptions, HijackConnector, HijackEvent, HijackedSocket, Hijacker, HttpClient,
    PendingConnect,
};
#[cfg(test)]
pub(crate) use hijack::Verdict;
pub use observer::{RawObservation, RawTap};
pub use request::{InterceptedRequest, RequestBody};
pub use response::{ChannelBody, ResponseSink};
pub use stream::HijackedIo;
