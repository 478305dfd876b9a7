//! Wire-message model for the Hornet control channel.
//!
//! Messages travel over a topic exchange; the routing key selects the
//! recipient and the body is a self-describing map encoded as JSON or
//! MsgPack. This crate owns the message envelope, the numeric message
//! codes, the dynamic payload value, and the codecs for both encodings.

pub mod codes;
pub mod error;
pub mod message;
pub mod value;

pub use codes::{MsgOp, MsgType, RETCODE_SUCCESS};
pub use error::{ProtocolError, Result};
pub use message::{Message, SenderInfo, ENCODING_JSON, ENCODING_MSGPACK, TARGET_SEPARATOR};
pub use value::Value;
