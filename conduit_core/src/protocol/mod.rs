//! Line-delimited connector protocol.
//!
//! Connectors write one JSON object per line on stdout, discriminated by a
//! `type` field. Inputs (configuration, configured catalog, prior state) are
//! written to the connector's stdin in the same vocabulary.

pub mod codec;
pub mod messages;

pub use codec::{ProtocolCodec, ProtocolEvent};
pub use messages::*;
