// src/error.rs

//! Engine-level errors.
//!
//! Every variant is a structured result returned to the caller; none of them
//! is fatal to the store. The `Display` text follows the RESP error
//! conventions so the network layer can forward it unchanged.

use ordered_float::OrderedFloat;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(String),

    #[error("ERR invalid longitude,latitude pair {0:.6},{1:.6}")]
    InvalidCoordinates(OrderedFloat<f64>, OrderedFloat<f64>),

    #[error("ERR could not decode requested zset member")]
    MemberNotFound,

    #[error("WRONGTYPE Key is not a valid HyperLogLog string value.")]
    InvalidHll,

    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidStreamId,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    StreamIdTooSmall,

    #[error("ERR The XGROUP subcommand requires the key to exist")]
    NoSuchKey,

    #[error("NOGROUP No such key '{key}' or consumer group '{group}'")]
    GroupNotFound { key: String, group: String },

    #[error("BUSYGROUP Consumer Group name already exists")]
    GroupExists,

    #[error("EXECABORT Transaction discarded: {0}")]
    TransactionAborted(String),

    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    #[error("ERR {0} without MULTI")]
    NotInMulti(&'static str),

    #[error("ERR WATCH inside MULTI is not allowed")]
    WatchInMulti,

    #[error("ERR Can't execute '{0}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context")]
    SubscribedContext(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR internal error: {0}")]
    Internal(&'static str),
}

impl StoreError {
    pub(crate) fn arity(cmd: &str) -> Self {
        StoreError::WrongArity(cmd.to_ascii_lowercase())
    }

    pub(crate) fn group_not_found(key: &[u8], group: &[u8]) -> Self {
        StoreError::GroupNotFound {
            key: String::from_utf8_lossy(key).into_owned(),
            group: String::from_utf8_lossy(group).into_owned(),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_follow_resp_prefixes() {
        assert!(StoreError::WrongType.to_string().starts_with("WRONGTYPE"));
        assert!(StoreError::GroupExists.to_string().starts_with("BUSYGROUP"));
        assert_eq!(
            StoreError::arity("SETEX").to_string(),
            "ERR wrong number of arguments for 'setex' command"
        );
        let e = StoreError::InvalidCoordinates(OrderedFloat(200.0), OrderedFloat(1.5));
        assert_eq!(
            e.to_string(),
            "ERR invalid longitude,latitude pair 200.000000,1.500000"
        );
    }
}
