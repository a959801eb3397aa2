//! Wire schema and request/response correlation with the relay server

pub mod messages;
pub mod requests;

pub use messages::{
    decode, encode, DownstreamMessage, GroupMessage, MemberInfo, PeerMessage, UpstreamMessage,
};
pub use requests::{RequestHandle, RequestKind, RequestOutcome, WaitingRequests};
