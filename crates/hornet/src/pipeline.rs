//! Plumbing shared by the pipeline stages.
//!
//! Every stage owns a receive end for incoming files, a send end for its
//! returns, a request line to the supervisor, and the shutdown token.
//! Channel operations go through the helpers here so that a full or
//! closed queue can never wedge a stage past shutdown.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, SendTimeoutError};

use crate::control::{ControlRequest, ShutdownToken, POLL_INTERVAL};
use crate::fileinfo::FileInfo;

/// The envelope a stage hands back to the scheduler.
#[derive(Debug)]
pub struct OperatorReturn {
    /// Stage that produced this return.
    pub operator: &'static str,
    pub file: FileInfo,
    pub error: Option<anyhow::Error>,
    /// A fatal return drops the file from the pipeline; the pipeline
    /// itself keeps running.
    pub fatal: bool,
}

impl OperatorReturn {
    pub fn clean(operator: &'static str, file: FileInfo) -> OperatorReturn {
        OperatorReturn {
            operator,
            file,
            error: None,
            fatal: false,
        }
    }

    pub fn failed(operator: &'static str, file: FileInfo, error: anyhow::Error, fatal: bool) -> OperatorReturn {
        OperatorReturn {
            operator,
            file,
            error: Some(error),
            fatal,
        }
    }
}

/// What a stage's receive loop saw.
pub enum StageInput {
    File(FileInfo),
    /// Nothing arrived within the poll interval.
    Idle,
    /// The input queue closed or shutdown was requested.
    Done,
}

/// Channel ends handed to a stage by the scheduler.
#[derive(Clone)]
pub struct StageContext {
    pub files_rx: Receiver<FileInfo>,
    pub returns_tx: Sender<OperatorReturn>,
    pub requests_tx: Sender<ControlRequest>,
    pub shutdown: ShutdownToken,
}

impl StageContext {
    /// Wait briefly for the next file.
    pub fn next_file(&self) -> StageInput {
        if self.shutdown.is_shutdown() {
            return StageInput::Done;
        }
        match self.files_rx.recv_timeout(POLL_INTERVAL) {
            Ok(file) => StageInput::File(file),
            Err(RecvTimeoutError::Timeout) => StageInput::Idle,
            Err(RecvTimeoutError::Disconnected) => StageInput::Done,
        }
    }

    /// Send a return to the scheduler, backing off while the queue is
    /// full. Returns false when shutdown arrived or the queue closed
    /// before the send went through.
    pub fn send_return(&self, ret: OperatorReturn) -> bool {
        let mut pending = ret;
        loop {
            match self.returns_tx.send_timeout(pending, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(r)) => {
                    if self.shutdown.is_shutdown() {
                        return false;
                    }
                    pending = r;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    /// Tell the supervisor this task cannot continue.
    pub fn cannot_continue(&self) {
        let _ = self.requests_tx.send(ControlRequest::ThreadCannotContinue);
    }
}
