//! Command dispatch.
//!
//! Turns decoded controller commands into handler calls and collects one
//! `CommandResult` per command. Every failure stays local to its command.

use std::error::Error as _;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::DecodedCommand;
use crate::command::{BatchResult, CommandKind, CommandRequest, CommandResult, ResponsePayload};
use crate::error::L1Error;
use crate::handler::L1Handler;

#[derive(Clone)]
pub struct OperationDispatcher {
    handler: Arc<dyn L1Handler>,
}

impl OperationDispatcher {
    pub fn new(handler: Arc<dyn L1Handler>) -> Self {
        Self { handler }
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn L1Handler> {
        &self.handler
    }

    /// Dispatch a decoded batch in order.
    pub async fn dispatch_batch(&self, commands: Vec<DecodedCommand>) -> BatchResult {
        let mut results = Vec::with_capacity(commands.len());
        for decoded in commands {
            let result = match decoded {
                DecodedCommand::Request(request) => self.dispatch(&request).await,
                DecodedCommand::Invalid { id, name, error } => {
                    warn!("rejecting command element (id={id:?}, name={name:?}): {error}");
                    let log = diagnostic_trace(&error, &id, &name);
                    CommandResult::failure(id, name, error.to_string(), log)
                }
            };
            results.push(result);
        }
        BatchResult::new(results)
    }

    /// Dispatch one command.
    pub async fn dispatch(&self, request: &CommandRequest) -> CommandResult {
        debug!("dispatching {} (id={})", request.name, request.id);
        match self.invoke(request).await {
            Ok(payload) => CommandResult::success(&request.id, &request.name, payload),
            Err(e) => {
                warn!("command {} (id={}) failed: {e}", request.name, request.id);
                let log = diagnostic_trace(&e, &request.id, &request.name);
                CommandResult::failure(&request.id, &request.name, e.to_string(), log)
            }
        }
    }

    async fn invoke(&self, request: &CommandRequest) -> Result<ResponsePayload, L1Error> {
        let kind = request
            .kind()
            .ok_or_else(|| L1Error::UnimplementedCommand(request.name.clone()))?;
        let args = required_parameters(kind, request)?;
        let h = &self.handler;

        let payload = match kind {
            CommandKind::Login => {
                h.login(args[0], args[1], args[2]).await?;
                ResponsePayload::None
            }
            CommandKind::Logout => {
                h.logout().await?;
                ResponsePayload::None
            }
            CommandKind::SetStateId => {
                h.set_state_id(args[0]).await?;
                ResponsePayload::None
            }
            CommandKind::GetStateId => ResponsePayload::StateId(h.get_state_id().await?),
            CommandKind::GetResourceDescription => {
                ResponsePayload::Resource(h.get_resource_description(args[0]).await?)
            }
            CommandKind::GetAttributeValue => {
                let value = h.get_attribute_value(args[0], args[1]).await?;
                ResponsePayload::Attribute {
                    name: args[1].to_string(),
                    value,
                }
            }
            CommandKind::MapBidi => {
                h.map_bidi(args[0], args[1], args[2]).await?;
                ResponsePayload::None
            }
            CommandKind::MapUni => {
                h.map_uni(args[0], args[1]).await?;
                ResponsePayload::None
            }
            CommandKind::MapClear => {
                h.map_clear(args[0], args[1]).await?;
                ResponsePayload::None
            }
            CommandKind::MapClearTo => {
                h.map_clear_to(args[0], args[1]).await?;
                ResponsePayload::None
            }
            CommandKind::SetSpeedManual => {
                h.set_speed_manual(args[0], args[1], args[2], args[3]).await?;
                ResponsePayload::None
            }
        };
        Ok(payload)
    }
}

/// Values of the command's required parameters, in table order. A name that
/// appears twice in the table takes the next occurrence on the wire.
fn required_parameters(
    kind: CommandKind,
    request: &CommandRequest,
) -> Result<Vec<&str>, L1Error> {
    let required = kind.signature().required;
    let mut values = Vec::with_capacity(required.len());
    for (i, &name) in required.iter().enumerate() {
        let occurrence = required[..i].iter().filter(|&&n| n == name).count();
        let value = request.parameters.nth(name, occurrence).ok_or_else(|| {
            L1Error::MissingParameter {
                command: request.name.clone(),
                parameter: name,
            }
        })?;
        values.push(value);
    }
    Ok(values)
}

/// Multi-line diagnostic placed in a failed result's `Log` block: the error
/// chain, the device reply (when there is one) and the command it came from.
#[must_use]
pub fn diagnostic_trace(error: &L1Error, id: &str, name: &str) -> String {
    let mut out = format!("Command {name} (CommandId {id}) failed\n{error}");
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(out, "\ncaused by: {cause}");
        source = cause.source();
    }
    if let Some(reply) = error.device_reply() {
        let _ = write!(out, "\ndevice reply:\n{}", reply.trim());
    }
    out
}
