//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

use crate::shardnode::{ApiReply, EntryId};

/// Customized error type for the oramshard crate.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OramShardError(pub String);

impl fmt::Display for OramShardError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `OramShardError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for OramShardError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                OramShardError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::SetError<tokio::net::TcpListener>);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::mpsc::error::SendError<(EntryId, Vec<u8>)>);
impl_from_error!(tokio::sync::mpsc::error::SendError<ApiReply>);
