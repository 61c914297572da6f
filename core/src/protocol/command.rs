//! Feature command channel framing
//!
//! Commands travel on the configuration service's command characteristic as
//! `[mask:u32 BE][type:u8][payload]`; replies come back as notifications on the same
//! characteristic framed `[timestamp:u16 LE][mask:u32 BE][type:u8][payload]`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::oneshot;

/// Size of the reply header (timestamp, mask, type)
pub const RESPONSE_HEADER_SIZE: usize = 7;
/// Size of the command header (mask, type)
pub const COMMAND_HEADER_SIZE: usize = 5;

/// Framing and routing failures on the wire
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Framing error in {feature}: need {needed} bytes, {available} available")]
    Framing {
        feature: String,
        needed: usize,
        available: usize,
    },
    #[error("Command response too short: {0} bytes")]
    ShortResponse(usize),
    #[error("No feature registered for command mask {0:#010x}")]
    UnroutableCommand(u32),
}

/// A command addressed to one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPacket {
    pub mask: u32,
    pub command_type: u8,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    pub fn new(mask: u32, command_type: u8, payload: &[u8]) -> Self {
        Self {
            mask,
            command_type,
            payload: payload.to_vec(),
        }
    }

    /// Serialize for the command characteristic
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(COMMAND_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.mask.to_be_bytes());
        bytes.push(self.command_type);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// A reply received on the command characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub timestamp: u16,
    pub mask: u32,
    pub command_type: u8,
    pub payload: Vec<u8>,
}

impl CommandResponse {
    /// Parse a command characteristic notification
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < RESPONSE_HEADER_SIZE {
            return Err(ProtocolError::ShortResponse(data.len()));
        }
        Ok(Self {
            timestamp: u16::from_le_bytes([data[0], data[1]]),
            mask: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            command_type: data[6],
            payload: data[RESPONSE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Callers waiting for a reply to a specific `(mask, type)` pair.
///
/// Only the first matching reply completes a waiter; unanswered waiters are dropped when
/// the receiving side gives up.
#[derive(Debug, Default)]
pub struct PendingCommands {
    waiters: HashMap<(u32, u8), Vec<oneshot::Sender<CommandResponse>>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next reply for `(mask, command_type)`
    pub fn register(&mut self, mask: u32, command_type: u8) -> oneshot::Receiver<CommandResponse> {
        let (tx, rx) = oneshot::channel();
        let waiters = self.waiters.entry((mask, command_type)).or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        rx
    }

    /// Hand a reply to every live waiter for its key; returns how many were completed
    pub fn complete(&mut self, response: &CommandResponse) -> usize {
        let Some(waiters) = self.waiters.remove(&(response.mask, response.command_type)) else {
            return 0;
        };
        waiters
            .into_iter()
            .filter_map(|tx| tx.send(response.clone()).ok())
            .count()
    }

    /// Drop every waiter (their receivers observe a closed channel)
    pub fn clear(&mut self) {
        self.waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
