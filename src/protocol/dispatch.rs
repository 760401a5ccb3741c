use std::collections::HashMap;

use log::{debug, warn};
use serde::Serialize;
use serde_json::json;

use crate::error::MixerError;
use crate::session::SessionClient;

use super::payload::CommandPayload;
use super::{CommandMessage, HeartbeatMessage, Message, ResponseMessage};

/// Routes inbound messages to the session controller and produces exactly
/// one response per command or heartbeat, never zero, never two. The
/// transport's only jobs are handing messages in and carrying the returned
/// response back out.
pub struct CommandDispatcher {
    session: SessionClient,
    heartbeats: HeartbeatMonitor,
}

impl CommandDispatcher {
    pub fn new(session: SessionClient) -> Self {
        Self {
            session,
            heartbeats: HeartbeatMonitor::new(),
        }
    }

    /// Handles one inbound message. Commands and heartbeats yield a
    /// response; stray responses or events from a peer yield none and are
    /// only logged.
    pub fn dispatch(&mut self, message: &Message) -> Option<ResponseMessage> {
        match message {
            Message::Command(command) => Some(self.dispatch_command(command)),
            Message::Heartbeat(heartbeat) => Some(self.acknowledge_heartbeat(heartbeat)),
            Message::Response(response) => {
                warn!(
                    "ignoring inbound response {} (in response to {})",
                    response.message_id, response.in_response_to
                );
                None
            }
            Message::Event(event) => {
                warn!("ignoring inbound event '{}'", event.event_name);
                None
            }
        }
    }

    fn dispatch_command(&mut self, command: &CommandMessage) -> ResponseMessage {
        let payload = match CommandPayload::decode(&command.command, command.parameters.clone()) {
            Ok(CommandPayload::Unknown { command: opcode, .. }) => {
                debug!("unknown command opcode '{opcode}'");
                return ResponseMessage::err(
                    command.message_id,
                    &MixerError::UnknownCommand(opcode),
                );
            }
            Ok(payload) => payload,
            Err(err) => return ResponseMessage::err(command.message_id, &err),
        };
        match self.session.command(payload) {
            Ok(data) => ResponseMessage::ok(command.message_id, data),
            Err(err) => ResponseMessage::err(command.message_id, &err),
        }
    }

    fn acknowledge_heartbeat(&mut self, heartbeat: &HeartbeatMessage) -> ResponseMessage {
        let outcome = self
            .heartbeats
            .observe(&heartbeat.client_id, heartbeat.sequence_number);
        ResponseMessage::ok(
            heartbeat.message_id,
            Some(json!({
                "clientId": heartbeat.client_id,
                "sequenceNumber": heartbeat.sequence_number,
                "outcome": outcome,
            })),
        )
    }
}

/// What a heartbeat told us about the sender's sequence. Regressions are a
/// liveness signal, not a correctness gate: they are reported and logged,
/// never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HeartbeatOutcome {
    First,
    InSequence,
    Gap { missed: u64 },
    Regression { last_seen: u64, received: u64 },
}

/// Tracks the last heartbeat sequence seen per client id.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    last_seen: HashMap<String, u64>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, client_id: &str, sequence: u64) -> HeartbeatOutcome {
        match self.last_seen.get(client_id).copied() {
            None => {
                self.last_seen.insert(client_id.to_owned(), sequence);
                HeartbeatOutcome::First
            }
            Some(last) if sequence == last + 1 => {
                self.last_seen.insert(client_id.to_owned(), sequence);
                HeartbeatOutcome::InSequence
            }
            Some(last) if sequence > last => {
                self.last_seen.insert(client_id.to_owned(), sequence);
                HeartbeatOutcome::Gap {
                    missed: sequence - last - 1,
                }
            }
            Some(last) => {
                // Keep the high-water mark; a reset client will regress
                // until it catches back up.
                warn!(
                    "heartbeat regression from '{client_id}': got {sequence} after {last}"
                );
                HeartbeatOutcome::Regression {
                    last_seen: last,
                    received: sequence,
                }
            }
        }
    }
}
