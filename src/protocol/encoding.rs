//! Newline-delimited JSON framing for process workers.

use serde::Serialize;

use super::{CoordinatorMessage, ProtocolError, WorkerMessage};

/// Upper bound on a single encoded message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16 MB

/// Encode a message as one JSON line (no trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(message)?;
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: line.len(), max: MAX_MESSAGE_SIZE });
    }
    Ok(line)
}

fn check_size(line: &str) -> Result<&str, ProtocolError> {
    // Size check happens before parsing.
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: line.len(), max: MAX_MESSAGE_SIZE });
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::InvalidFormat("empty line".into()));
    }
    Ok(trimmed)
}

/// Decode one line received by a worker.
pub fn decode_coordinator_message(line: &str) -> Result<CoordinatorMessage, ProtocolError> {
    Ok(serde_json::from_str(check_size(line)?)?)
}

/// Decode one line received by the coordinator.
pub fn decode_worker_message(line: &str) -> Result<WorkerMessage, ProtocolError> {
    Ok(serde_json::from_str(check_size(line)?)?)
}
