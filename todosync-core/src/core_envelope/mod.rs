//! Authenticated envelopes for server and peer traffic

pub mod codec;
pub mod errors;

pub use codec::{Envelope, EnvelopeCodec, GroupEnvelope};
pub use errors::{CodecError, CodecResult};
