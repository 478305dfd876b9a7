//! Numeric message codes used on the wire.
//!
//! The values are fixed by the wire protocol; peers written in other
//! languages rely on them, so they must never be renumbered.

use crate::error::{ProtocolError, Result};

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MsgType {
    Reply = 2,
    Request = 3,
    Alert = 4,
    Info = 5,
}

impl MsgType {
    pub fn from_u64(value: u64) -> Result<Self> {
        match value {
            2 => Ok(MsgType::Reply),
            3 => Ok(MsgType::Request),
            4 => Ok(MsgType::Alert),
            5 => Ok(MsgType::Info),
            other => Err(ProtocolError::UnknownMsgType(other)),
        }
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// Operation code carried by request messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MsgOp {
    Set = 0,
    Get = 1,
    Config = 6,
    Send = 7,
    Run = 8,
    Cmd = 9,
}

impl MsgOp {
    /// Unknown operation codes are preserved as `Set` (the zero value on
    /// the wire); requests with operations Hornet does not act on are
    /// logged and ignored by the receiver.
    pub fn from_u64(value: u64) -> Self {
        match value {
            1 => MsgOp::Get,
            6 => MsgOp::Config,
            7 => MsgOp::Send,
            8 => MsgOp::Run,
            9 => MsgOp::Cmd,
            _ => MsgOp::Set,
        }
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// Return code signalling success in a reply message.
pub const RETCODE_SUCCESS: u64 = 0;
