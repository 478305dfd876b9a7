use thiserror::Error;

/// Protocol error type
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message type code: {0}")]
    UnknownMsgType(u64),

    #[error("message is missing a required element: {0}")]
    MissingField(&'static str),

    #[error("message field {0} is malformed")]
    MalformedField(&'static str),

    #[error("message body is not a map")]
    BodyNotAMap,

    #[error("content encoding is not understood: {0}")]
    UnsupportedEncoding(String),

    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
