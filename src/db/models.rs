use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Client liveness state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Inactive,
    Active,
    Maintenance,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(Self::Inactive),
            "active" => Some(Self::Active),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Command lifecycle state.
///
/// `pending_dispatch -> dispatched -> acknowledged -> in_progress` and then
/// one of the terminal states. Agents report their own progress, and retries
/// may arrive out of order, so transitions among the non-terminal states are
/// not ordered; the terminal subset is the only gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    PendingDispatch,
    Dispatched,
    Acknowledged,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingDispatch => "pending_dispatch",
            Self::Dispatched => "dispatched",
            Self::Acknowledged => "acknowledged",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_dispatch" => Some(Self::PendingDispatch),
            "dispatched" => Some(Self::Dispatched),
            "acknowledged" => Some(Self::Acknowledged),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// No further transition is permitted out of a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registered agent
#[derive(Debug, Clone, FromRow)]
pub struct Client {
    pub id: String,
    pub client_name: String,
    pub ip_address: Option<String>,
    pub os_info: Option<String>,
    pub status: String,
    pub api_key_hash: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Client {
    pub fn is_active(&self) -> bool {
        ClientStatus::parse(&self.status) == Some(ClientStatus::Active)
    }
}

/// New client registration request
#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub client_name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub os_info: Option<String>,
}

/// Client record as exposed over the API. The credential digest has no
/// field here at all; it never leaves the registry.
#[derive(Debug, Clone, Serialize)]
pub struct ClientView {
    pub id: String,
    pub client_name: String,
    pub ip_address: Option<String>,
    pub os_info: Option<String>,
    pub status: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl From<Client> for ClientView {
    fn from(client: Client) -> Self {
        Self {
            id: client.id,
            client_name: client.client_name,
            ip_address: client.ip_address,
            os_info: client.os_info,
            status: client.status,
            registered_at: client.registered_at,
            last_heartbeat: client.last_heartbeat,
        }
    }
}

/// Registration response: the one and only place the plaintext key appears
#[derive(Debug, Clone, Serialize)]
pub struct ClientWithKey {
    #[serde(flatten)]
    pub client: ClientView,
    pub api_key: String,
}

/// A unit of work targeted at exactly one client
#[derive(Debug, Clone, FromRow)]
pub struct Command {
    pub id: String,
    pub client_id: String,
    pub command_type: String,
    pub payload: String, // opaque JSON document
    pub status: String,
    pub dispatch_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub execution_result: Option<String>,
}

impl Command {
    /// Parsed payload. The core never interprets it; malformed stored JSON
    /// degrades to null rather than erroring.
    pub fn payload_value(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or_default()
    }
}

/// New command creation request (admin)
#[derive(Debug, Clone, Deserialize)]
pub struct NewCommand {
    pub client_id: String,
    pub command_type: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub dispatch_deadline: Option<DateTime<Utc>>,
}

/// Status report from the owning agent
#[derive(Debug, Clone, Deserialize)]
pub struct CommandStatusUpdate {
    pub status: CommandStatus,
    #[serde(default)]
    pub execution_result: Option<String>,
}

/// Privileged field rewrite (admin). Resurrecting a terminal command
/// requires `force`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminCommandUpdate {
    #[serde(default)]
    pub status: Option<CommandStatus>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub dispatch_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub force: bool,
}

/// Command as exposed over the API, payload parsed
#[derive(Debug, Clone, Serialize)]
pub struct CommandView {
    pub id: String,
    pub client_id: String,
    pub command_type: String,
    pub payload: Value,
    pub status: String,
    pub dispatch_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub execution_result: Option<String>,
}

impl From<Command> for CommandView {
    fn from(command: Command) -> Self {
        let payload = command.payload_value();
        Self {
            id: command.id,
            client_id: command.client_id,
            command_type: command.command_type,
            payload,
            status: command.status,
            dispatch_deadline: command.dispatch_deadline,
            created_at: command.created_at,
            updated_at: command.updated_at,
            execution_result: command.execution_result,
        }
    }
}

/// Telemetry record submitted by an agent. Immutable once written.
#[derive(Debug, Clone, FromRow)]
pub struct SecurityEvent {
    pub id: String,
    pub client_id: String,
    pub event_type: String,
    pub severity: String,
    pub source_ip: Option<String>,
    pub details: Option<String>, // opaque JSON document
    pub db_name_target: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Incoming event record. `client_id` is never part of the wire format;
/// attribution always comes from the authenticated caller.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSecurityEvent {
    pub event_type: String,
    pub severity: String,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub db_name_target: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Event as exposed over the API, details parsed
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEventView {
    pub id: String,
    pub client_id: String,
    pub event_type: String,
    pub severity: String,
    pub source_ip: Option<String>,
    pub details: Option<Value>,
    pub db_name_target: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<SecurityEvent> for SecurityEventView {
    fn from(event: SecurityEvent) -> Self {
        let details = event
            .details
            .as_deref()
            .map(|d| serde_json::from_str(d).unwrap_or_default());
        Self {
            id: event.id,
            client_id: event.client_id,
            event_type: event.event_type,
            severity: event.severity,
            source_ip: event.source_ip,
            details,
            db_name_target: event.db_name_target,
            timestamp: event.timestamp,
        }
    }
}
