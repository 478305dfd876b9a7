//! The message envelope and its wire codecs.
//!
//! On the wire a message is a map with the fields `msgtype`, `msgop`,
//! `retcode`, `return_msg`, `timestamp`, `sender_info` and `payload`,
//! encoded as JSON or MsgPack according to the delivery's
//! content-encoding property. The routing key carries the target: the
//! tokens after the receiving queue's name.

use chrono::{SecondsFormat, Utc};
use crossbeam_channel::Sender;

use crate::codes::{MsgOp, MsgType, RETCODE_SUCCESS};
use crate::error::{ProtocolError, Result};
use crate::value::Value;

pub const ENCODING_JSON: &str = "application/json";
pub const ENCODING_MSGPACK: &str = "application/msgpack";

/// Separator between the tokens of a routing key.
pub const TARGET_SEPARATOR: char = '.';

/// Identity block attached to every outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderInfo {
    pub package: String,
    pub exe: String,
    pub version: String,
    pub commit: String,
    pub hostname: String,
    pub username: String,
}

impl SenderInfo {
    /// Gather the identity of this process. Called once at startup; the
    /// result is cloned into every message.
    pub fn collect() -> SenderInfo {
        SenderInfo {
            package: "hornet".to_string(),
            exe: std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("HORNET_BUILD_COMMIT").unwrap_or("unknown").to_string(),
            hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
            username: whoami::username(),
        }
    }

    fn to_wire(&self) -> Value {
        let mut map = Value::empty_map();
        map.insert("package", self.package.clone());
        map.insert("exe", self.exe.clone());
        map.insert("version", self.version.clone());
        map.insert("commit", self.commit.clone());
        map.insert("hostname", self.hostname.clone());
        map.insert("username", self.username.clone());
        map
    }

    fn from_wire(value: &Value) -> SenderInfo {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        SenderInfo {
            package: field("package"),
            exe: field("exe"),
            version: field("version"),
            commit: field("commit"),
            hostname: field("hostname"),
            username: field("username"),
        }
    }
}

/// A control-channel message.
///
/// `reply_tx` never touches the wire: a request that expects a reply
/// carries the single-use channel on which the correlated reply should be
/// delivered.
#[derive(Debug, Clone)]
pub struct Message {
    pub target: Vec<String>,
    pub encoding: String,
    pub corr_id: String,
    pub msg_type: MsgType,
    pub msg_op: MsgOp,
    pub ret_code: u64,
    pub ret_msg: String,
    pub timestamp: String,
    pub sender_info: SenderInfo,
    pub payload: Value,
    pub reply_tx: Option<Sender<Message>>,
}

/// Current time in the wire's timestamp format (RFC 3339, UTC, whole
/// seconds).
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Message {
    /// A request message; the payload is left for the caller to fill in.
    pub fn request(
        sender_info: &SenderInfo,
        target: Vec<String>,
        encoding: &str,
        msg_op: MsgOp,
        reply_tx: Option<Sender<Message>>,
    ) -> Message {
        Message {
            target,
            encoding: encoding.to_string(),
            corr_id: String::new(),
            msg_type: MsgType::Request,
            msg_op,
            ret_code: RETCODE_SUCCESS,
            ret_msg: String::new(),
            timestamp: timestamp_now(),
            sender_info: sender_info.clone(),
            payload: Value::Null,
            reply_tx,
        }
    }

    /// A reply message correlated with a previously received request.
    pub fn reply(
        sender_info: &SenderInfo,
        target: Vec<String>,
        encoding: &str,
        corr_id: String,
        ret_code: u64,
    ) -> Message {
        Message {
            target,
            encoding: encoding.to_string(),
            corr_id,
            msg_type: MsgType::Reply,
            msg_op: MsgOp::Set,
            ret_code,
            ret_msg: String::new(),
            timestamp: timestamp_now(),
            sender_info: sender_info.clone(),
            payload: Value::Null,
            reply_tx: None,
        }
    }

    /// The routing key this message publishes under.
    pub fn routing_key(&self) -> String {
        self.target
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(&TARGET_SEPARATOR.to_string())
    }

    fn to_wire(&self) -> Value {
        let mut body = Value::empty_map();
        body.insert("msgtype", self.msg_type.as_u64());
        body.insert("msgop", self.msg_op.as_u64());
        body.insert("retcode", self.ret_code);
        body.insert("return_msg", self.ret_msg.clone());
        body.insert("timestamp", self.timestamp.clone());
        body.insert("sender_info", self.sender_info.to_wire());
        body.insert("payload", self.payload.clone());
        body
    }

    /// Encode the message body according to its content encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = self.to_wire();
        match self.encoding.as_str() {
            ENCODING_JSON => Ok(serde_json::to_vec(&body)?),
            ENCODING_MSGPACK => Ok(rmp_serde::to_vec(&body)?),
            other => Err(ProtocolError::UnsupportedEncoding(other.to_string())),
        }
    }

    /// Decode a delivery into a message.
    ///
    /// `msgtype`, `timestamp` and `sender_info` are always required;
    /// replies must additionally carry `retcode` and requests `msgop`.
    /// The target is the tail of the routing key after the queue name.
    pub fn decode(
        body: &[u8],
        encoding: &str,
        corr_id: String,
        routing_key: &str,
    ) -> Result<Message> {
        let wire: Value = match encoding {
            ENCODING_JSON => serde_json::from_slice(body)?,
            ENCODING_MSGPACK => rmp_serde::from_slice(body)?,
            other => return Err(ProtocolError::UnsupportedEncoding(other.to_string())),
        };
        if wire.as_map().is_none() {
            return Err(ProtocolError::BodyNotAMap);
        }

        let msg_type = wire
            .get("msgtype")
            .ok_or(ProtocolError::MissingField("msgtype"))?
            .as_u64()
            .ok_or(ProtocolError::MalformedField("msgtype"))
            .and_then(MsgType::from_u64)?;
        let timestamp = wire
            .get("timestamp")
            .ok_or(ProtocolError::MissingField("timestamp"))?
            .as_str()
            .ok_or(ProtocolError::MalformedField("timestamp"))?
            .to_string();
        let sender_info = SenderInfo::from_wire(
            wire.get("sender_info")
                .ok_or(ProtocolError::MissingField("sender_info"))?,
        );

        let ret_code = match msg_type {
            MsgType::Reply => wire
                .get("retcode")
                .ok_or(ProtocolError::MissingField("retcode"))?
                .as_u64()
                .ok_or(ProtocolError::MalformedField("retcode"))?,
            _ => wire.get("retcode").and_then(Value::as_u64).unwrap_or(RETCODE_SUCCESS),
        };
        let msg_op = match msg_type {
            MsgType::Request => MsgOp::from_u64(
                wire.get("msgop")
                    .ok_or(ProtocolError::MissingField("msgop"))?
                    .as_u64()
                    .ok_or(ProtocolError::MalformedField("msgop"))?,
            ),
            _ => MsgOp::from_u64(wire.get("msgop").and_then(Value::as_u64).unwrap_or(0)),
        };
        let ret_msg = wire
            .get("return_msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = wire.get("payload").cloned().unwrap_or(Value::Null);

        let target = routing_key
            .split(TARGET_SEPARATOR)
            .skip(1)
            .map(str::to_string)
            .collect();

        Ok(Message {
            target,
            encoding: encoding.to_string(),
            corr_id,
            msg_type,
            msg_op,
            ret_code,
            ret_msg,
            timestamp,
            sender_info,
            payload,
            reply_tx: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sender() -> SenderInfo {
        SenderInfo {
            package: "hornet".into(),
            exe: "/usr/local/bin/hornet".into(),
            version: "0.1.0".into(),
            commit: "abcdef0".into(),
            hostname: "daq1".into(),
            username: "operator".into(),
        }
    }

    fn sample_request(encoding: &str) -> Message {
        let mut msg = Message::request(
            &sample_sender(),
            vec!["database".into()],
            encoding,
            MsgOp::Cmd,
            None,
        );
        msg.corr_id = "corr-1234".into();
        let mut payload = Value::empty_map();
        payload.insert("values", Value::List(vec![Value::from("do_insert")]));
        payload.insert("file_name", "run42.dat");
        payload.insert("file_hash", "900150983cd24fb0d6963f7d28e17f72");
        msg.payload = payload;
        msg
    }

    fn assert_round_trip(encoding: &str) {
        let msg = sample_request(encoding);
        let body = msg.encode().unwrap();
        let decoded =
            Message::decode(&body, encoding, msg.corr_id.clone(), "hornet.database").unwrap();
        assert_eq!(decoded.target, vec!["database".to_string()]);
        assert_eq!(decoded.encoding, msg.encoding);
        assert_eq!(decoded.corr_id, msg.corr_id);
        assert_eq!(decoded.msg_type, msg.msg_type);
        assert_eq!(decoded.msg_op, msg.msg_op);
        assert_eq!(decoded.ret_code, msg.ret_code);
        assert_eq!(decoded.ret_msg, msg.ret_msg);
        assert_eq!(decoded.timestamp, msg.timestamp);
        assert_eq!(decoded.sender_info, msg.sender_info);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn json_round_trip() {
        assert_round_trip(ENCODING_JSON);
    }

    #[test]
    fn msgpack_round_trip() {
        assert_round_trip(ENCODING_MSGPACK);
    }

    #[test]
    fn decode_requires_msgtype() {
        let body = serde_json::to_vec(&serde_json::json!({
            "timestamp": "2026-01-01T00:00:00Z",
            "sender_info": {},
        }))
        .unwrap();
        let err = Message::decode(&body, ENCODING_JSON, String::new(), "hornet").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("msgtype")));
    }

    #[test]
    fn decode_requires_msgop_for_requests() {
        let body = serde_json::to_vec(&serde_json::json!({
            "msgtype": 3,
            "timestamp": "2026-01-01T00:00:00Z",
            "sender_info": {},
        }))
        .unwrap();
        let err = Message::decode(&body, ENCODING_JSON, String::new(), "hornet").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("msgop")));
    }

    #[test]
    fn decode_requires_retcode_for_replies() {
        let body = serde_json::to_vec(&serde_json::json!({
            "msgtype": 2,
            "timestamp": "2026-01-01T00:00:00Z",
            "sender_info": {},
        }))
        .unwrap();
        let err = Message::decode(&body, ENCODING_JSON, String::new(), "hornet").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("retcode")));
    }

    #[test]
    fn routing_key_tail_becomes_target() {
        let body = sample_request(ENCODING_JSON).encode().unwrap();
        let decoded =
            Message::decode(&body, ENCODING_JSON, String::new(), "hornet.quit-hornet.extra")
                .unwrap();
        assert_eq!(
            decoded.target,
            vec!["quit-hornet".to_string(), "extra".to_string()]
        );
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let msg = sample_request(ENCODING_JSON);
        let body = msg.encode().unwrap();
        let err = Message::decode(&body, "application/xml", String::new(), "hornet").unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedEncoding(_)));
    }

    #[test]
    fn routing_key_joins_target_tokens() {
        let msg = Message::request(
            &sample_sender(),
            vec!["hornet".into(), "quit-hornet".into()],
            ENCODING_JSON,
            MsgOp::Cmd,
            None,
        );
        assert_eq!(msg.routing_key(), "hornet.quit-hornet");
    }
}
