//! Per-connection pumps moving frames between the transport and the hub.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
