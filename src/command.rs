use chrono::{DateTime, Local};
use std::str::FromStr;

use crate::resource::ResourceInfo;

/// Controller command kinds. Variant names match the `CommandName` attribute
/// sent by the controller.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum CommandKind {
    Login,
    Logout,
    SetStateId,
    GetStateId,
    GetResourceDescription,
    GetAttributeValue,
    MapBidi,
    MapUni,
    MapClear,
    MapClearTo,
    SetSpeedManual,
}

/// Shape of the `ResponseInfo` block a command produces on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Empty,
    StateId,
    Attribute,
    Resource,
}

/// Static description of one command: wire parameter names (in order) and
/// the payload it answers with.
#[derive(Debug, Clone, Copy)]
pub struct CommandSignature {
    pub required: &'static [&'static str],
    pub payload: PayloadShape,
}

impl CommandKind {
    pub const ALL: [Self; 11] = [
        Self::Login,
        Self::Logout,
        Self::SetStateId,
        Self::GetStateId,
        Self::GetResourceDescription,
        Self::GetAttributeValue,
        Self::MapBidi,
        Self::MapUni,
        Self::MapClear,
        Self::MapClearTo,
        Self::SetSpeedManual,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "Login",
            Self::Logout => "Logout",
            Self::SetStateId => "SetStateId",
            Self::GetStateId => "GetStateId",
            Self::GetResourceDescription => "GetResourceDescription",
            Self::GetAttributeValue => "GetAttributeValue",
            Self::MapBidi => "MapBidi",
            Self::MapUni => "MapUni",
            Self::MapClear => "MapClear",
            Self::MapClearTo => "MapClearTo",
            Self::SetSpeedManual => "SetSpeedManual",
        }
    }

    #[must_use]
    pub const fn signature(&self) -> CommandSignature {
        const fn signature(required: &'static [&'static str], payload: PayloadShape) -> CommandSignature {
            CommandSignature { required, payload }
        }
        match self {
            Self::Login => signature(&["Address", "User", "Password"], PayloadShape::Empty),
            Self::Logout => signature(&[], PayloadShape::Empty),
            Self::SetStateId => signature(&["StateId"], PayloadShape::Empty),
            Self::GetStateId => signature(&[], PayloadShape::StateId),
            Self::GetResourceDescription => signature(&["Address"], PayloadShape::Resource),
            Self::GetAttributeValue => signature(&["Address", "Attribute"], PayloadShape::Attribute),
            Self::MapBidi => signature(
                &["MapPort_A", "MapPort_B", "MappingGroupName"],
                PayloadShape::Empty,
            ),
            Self::MapUni => signature(&["SrcPort", "DstPort"], PayloadShape::Empty),
            // two MapPort children, in order
            Self::MapClear => signature(&["MapPort", "MapPort"], PayloadShape::Empty),
            Self::MapClearTo => signature(&["SrcPort", "DstPort"], PayloadShape::Empty),
            Self::SetSpeedManual => signature(
                &["SrcPort", "DstPort", "Speed", "Duplex"],
                PayloadShape::Empty,
            ),
        }
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown command name: {s}"))
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered `(name, value)` pairs from a command's `Parameters` block.
/// Names may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters(Vec<(String, String)>);

impl Parameters {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// First value stored under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.nth(name, 0)
    }

    /// `n`-th (0-based) value stored under `name`.
    #[must_use]
    pub fn nth(&self, name: &str, n: usize) -> Option<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .nth(n)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One decoded controller command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub id: String,
    /// Raw `CommandName`; it may not name a known command.
    pub name: String,
    pub parameters: Parameters,
}

impl CommandRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters,
        }
    }

    /// Known command kind, or `None` for names outside the command set.
    #[must_use]
    pub fn kind(&self) -> Option<CommandKind> {
        self.name.parse().ok()
    }
}

/// Success payload carried in `ResponseInfo`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponsePayload {
    #[default]
    None,
    StateId(String),
    Attribute { name: String, value: String },
    Resource(ResourceInfo),
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub id: String,
    pub name: String,
    pub succeeded: bool,
    pub error_message: Option<String>,
    pub log_text: Option<String>,
    pub timestamp: DateTime<Local>,
    pub payload: ResponsePayload,
}

impl CommandResult {
    pub fn success(id: impl Into<String>, name: impl Into<String>, payload: ResponsePayload) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            succeeded: true,
            error_message: None,
            log_text: None,
            timestamp: Local::now(),
            payload,
        }
    }

    pub fn failure(
        id: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
        log_text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            succeeded: false,
            error_message: Some(message.into()),
            log_text: Some(log_text.into()),
            timestamp: Local::now(),
            payload: ResponsePayload::None,
        }
    }
}

/// Results of one batch, in request order.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: Vec<CommandResult>,
}

impl BatchResult {
    #[must_use]
    pub const fn new(results: Vec<CommandResult>) -> Self {
        Self { results }
    }

    /// AND of every result's success flag (true for an empty batch).
    #[must_use]
    pub fn overall_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.succeeded)
    }
}
