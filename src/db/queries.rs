use crate::db::models::*;
use crate::error::{AppError, AppResult};
use crate::security::{self, PlainApiKey};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use tracing::info;
use uuid::Uuid;

pub type DbPool = Pool<Sqlite>;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Map a unique-constraint violation to the domain conflict it represents.
fn conflict_on_unique(err: sqlx::Error, detail: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::conflict(detail),
        _ => AppError::from(err),
    }
}

/// Database operations for registered clients
pub struct ClientRepo;

impl ClientRepo {
    /// Register a new client. Issues an API key, persists only its digest,
    /// and returns the plaintext exactly once. Fails with `Conflict` when
    /// the name is taken (names are unique, case-sensitive).
    pub async fn create_with_api_key(
        pool: &DbPool,
        new_client: NewClient,
        bcrypt_cost: u32,
    ) -> AppResult<(Client, PlainApiKey)> {
        const NAME_TAKEN: &str = "Client with this name already exists";

        if Self::get_by_name(pool, &new_client.client_name).await?.is_some() {
            return Err(AppError::conflict(NAME_TAKEN));
        }

        let api_key = security::generate_api_key();
        let api_key_hash = security::hash_api_key(api_key.reveal(), bcrypt_cost)?;
        let id = new_id();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO clients (id, client_name, ip_address, os_info, status, api_key_hash, registered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new_client.client_name)
        .bind(&new_client.ip_address)
        .bind(&new_client.os_info)
        .bind(ClientStatus::Active.as_str())
        .bind(&api_key_hash)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| conflict_on_unique(e, NAME_TAKEN))?;

        let client = Self::get(pool, &id)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created client"))?;
        info!("Registered client {} ({})", client.client_name, client.id);
        Ok((client, api_key))
    }

    pub async fn get(pool: &DbPool, client_id: &str) -> AppResult<Option<Client>> {
        let client = sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE id = ?")
            .bind(client_id)
            .fetch_optional(pool)
            .await?;
        Ok(client)
    }

    pub async fn get_by_name(pool: &DbPool, client_name: &str) -> AppResult<Option<Client>> {
        let client = sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE client_name = ?")
            .bind(client_name)
            .fetch_optional(pool)
            .await?;
        Ok(client)
    }

    pub async fn list(pool: &DbPool, skip: i64, limit: i64) -> AppResult<Vec<Client>> {
        let clients = sqlx::query_as::<_, Client>(
            "SELECT * FROM clients ORDER BY registered_at ASC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(pool)
        .await?;
        Ok(clients)
    }

    /// Resolve a presented API key to its client.
    ///
    /// Digests cannot be looked up by content, so this is a bounded linear
    /// scan across registered clients. `Unauthenticated` when nothing
    /// verifies, `Forbidden` when the matched client is not active.
    pub async fn authenticate(
        pool: &DbPool,
        api_key: &str,
        scan_limit: i64,
    ) -> AppResult<Client> {
        let candidates = sqlx::query_as::<_, Client>("SELECT * FROM clients LIMIT ?")
            .bind(scan_limit)
            .fetch_all(pool)
            .await?;

        let client = candidates
            .into_iter()
            .find(|c| security::verify_api_key(api_key, &c.api_key_hash))
            .ok_or_else(|| AppError::unauthenticated("Invalid API key"))?;

        if !client.is_active() {
            return Err(AppError::forbidden("Client is not active"));
        }
        Ok(client)
    }

    /// Record a heartbeat: last_heartbeat := now, status := active.
    /// Idempotent by construction.
    pub async fn touch_heartbeat(pool: &DbPool, client_id: &str) -> AppResult<Client> {
        sqlx::query("UPDATE clients SET last_heartbeat = ?, status = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(ClientStatus::Active.as_str())
            .bind(client_id)
            .execute(pool)
            .await?;

        Self::get(pool, client_id)
            .await?
            .ok_or_else(|| AppError::not_found("Client not found"))
    }
}

/// Database operations for the command ledger
pub struct CommandRepo;

impl CommandRepo {
    /// Queue a command for a client. The initial status is always
    /// `pending_dispatch`, even when the target client is not active.
    pub async fn create(pool: &DbPool, new_command: NewCommand) -> AppResult<Command> {
        if ClientRepo::get(pool, &new_command.client_id).await?.is_none() {
            return Err(AppError::not_found(format!(
                "Client with id {} not found. Cannot create command",
                new_command.client_id
            )));
        }

        let payload_json = new_command
            .payload
            .map(|p| serde_json::to_string(&p).unwrap())
            .unwrap_or_else(|| "{}".to_string());
        let id = new_id();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO commands (id, client_id, command_type, payload, status, dispatch_deadline, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new_command.client_id)
        .bind(&new_command.command_type)
        .bind(&payload_json)
        .bind(CommandStatus::PendingDispatch.as_str())
        .bind(new_command.dispatch_deadline)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get(pool, &id)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created command"))
    }

    pub async fn get(pool: &DbPool, command_id: &str) -> AppResult<Option<Command>> {
        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(command_id)
            .fetch_optional(pool)
            .await?;
        Ok(command)
    }

    /// Claim pending work for a client: select its `pending_dispatch`
    /// commands oldest first, capped at `limit`, and flip them to
    /// `dispatched` in the same statement. The single UPDATE is the
    /// atomicity boundary; two concurrent pollers can never claim the same
    /// command. Returns an empty vec when nothing is pending.
    pub async fn fetch_and_dispatch(
        pool: &DbPool,
        client_id: &str,
        limit: i64,
    ) -> AppResult<Vec<Command>> {
        let mut claimed = sqlx::query_as::<_, Command>(
            r#"
            UPDATE commands SET status = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM commands
                WHERE client_id = ? AND status = ?
                ORDER BY created_at ASC, id ASC
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(CommandStatus::Dispatched.as_str())
        .bind(Utc::now())
        .bind(client_id)
        .bind(CommandStatus::PendingDispatch.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await?;

        // RETURNING makes no ordering promise
        claimed.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(claimed)
    }

    /// Apply an agent's self-reported status transition.
    ///
    /// `NotFound` for an unknown command, `Forbidden` when the acting client
    /// does not own it, `Conflict` when the current status is terminal,
    /// regardless of the requested status. Non-terminal transitions are
    /// idempotent overwrites; retried reports arriving out of order are
    /// accepted as-is.
    pub async fn apply_client_update(
        pool: &DbPool,
        command_id: &str,
        acting_client_id: &str,
        new_status: CommandStatus,
        execution_result: Option<&str>,
    ) -> AppResult<Command> {
        let mut tx = pool.begin().await?;

        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(command_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::not_found("Command not found"))?;

        if command.client_id != acting_client_id {
            return Err(AppError::forbidden("Not authorized to update this command"));
        }

        if CommandStatus::parse(&command.status).is_some_and(CommandStatus::is_terminal) {
            return Err(AppError::conflict(format!(
                "Command is already in a final state: {}",
                command.status
            )));
        }

        let now = Utc::now();
        if let Some(result) = execution_result {
            sqlx::query(
                "UPDATE commands SET status = ?, execution_result = ?, updated_at = ? WHERE id = ?",
            )
            .bind(new_status.as_str())
            .bind(result)
            .bind(now)
            .bind(command_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE commands SET status = ?, updated_at = ? WHERE id = ?")
                .bind(new_status.as_str())
                .bind(now)
                .bind(command_id)
                .execute(&mut *tx)
                .await?;
        }

        let updated = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(command_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Privileged field rewrite, bypassing the ownership check. Changing the
    /// status of a terminal command still requires `force`; operators must
    /// resurrect explicitly, never by accident.
    pub async fn update_by_admin(
        pool: &DbPool,
        command_id: &str,
        update: AdminCommandUpdate,
    ) -> AppResult<Command> {
        let mut tx = pool.begin().await?;

        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(command_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::not_found("Command not found"))?;

        let terminal =
            CommandStatus::parse(&command.status).is_some_and(CommandStatus::is_terminal);
        if update.status.is_some() && terminal && !update.force {
            return Err(AppError::conflict(format!(
                "Command is already in a final state: {}. Pass force=true to override",
                command.status
            )));
        }

        if let Some(status) = update.status {
            sqlx::query("UPDATE commands SET status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(command_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(payload) = update.payload {
            sqlx::query("UPDATE commands SET payload = ? WHERE id = ?")
                .bind(serde_json::to_string(&payload).unwrap())
                .bind(command_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(deadline) = update.dispatch_deadline {
            sqlx::query("UPDATE commands SET dispatch_deadline = ? WHERE id = ?")
                .bind(deadline)
                .bind(command_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE commands SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(command_id)
            .execute(&mut *tx)
            .await?;

        let updated = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(command_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// All commands in the system, newest first, with optional filters.
    pub async fn list_all(
        pool: &DbPool,
        skip: i64,
        limit: i64,
        client_id: Option<&str>,
        status: Option<CommandStatus>,
    ) -> AppResult<Vec<Command>> {
        let mut sql = String::from("SELECT * FROM commands");
        let mut clauses = Vec::new();
        if client_id.is_some() {
            clauses.push("client_id = ?");
        }
        if status.is_some() {
            clauses.push("status = ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, Command>(&sql);
        if let Some(cid) = client_id {
            query = query.bind(cid);
        }
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        let commands = query.bind(limit).bind(skip).fetch_all(pool).await?;
        Ok(commands)
    }

    /// Mark overdue `dispatched`/`acknowledged` commands as timed out.
    ///
    /// The sweep is just another mutator: it only ever touches non-terminal
    /// rows, so it composes with the terminal-state lock that the client
    /// update path enforces. Returns the number of rows swept.
    pub async fn sweep_overdue(pool: &DbPool, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE commands SET status = ?, execution_result = ?, updated_at = ?
            WHERE dispatch_deadline IS NOT NULL
              AND dispatch_deadline < ?
              AND status IN (?, ?)
            "#,
        )
        .bind(CommandStatus::Timeout.as_str())
        .bind("Dispatch deadline exceeded")
        .bind(now)
        .bind(now)
        .bind(CommandStatus::Dispatched.as_str())
        .bind(CommandStatus::Acknowledged.as_str())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Filters for the event log read side
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub skip: i64,
    pub limit: i64,
    pub client_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: 100,
            client_id: None,
            event_type: None,
            severity: None,
            start_date: None,
            end_date: None,
        }
    }
}

/// Database operations for security events
pub struct EventRepo;

impl EventRepo {
    /// Append a batch of events, all attributed to the submitting client.
    /// Each row gets a fresh id; the timestamp is server-assigned when the
    /// record omits one.
    pub async fn create_batch(
        pool: &DbPool,
        client_id: &str,
        events: Vec<NewSecurityEvent>,
    ) -> AppResult<Vec<SecurityEvent>> {
        let mut tx = pool.begin().await?;
        let mut ids = Vec::with_capacity(events.len());

        for event in &events {
            let id = new_id();
            let timestamp = event.timestamp.unwrap_or_else(Utc::now);
            let details = event
                .details
                .as_ref()
                .map(|d| serde_json::to_string(d).unwrap());

            sqlx::query(
                r#"
                INSERT INTO security_events (id, client_id, event_type, severity, source_ip, details, db_name_target, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(client_id)
            .bind(&event.event_type)
            .bind(&event.severity)
            .bind(&event.source_ip)
            .bind(&details)
            .bind(&event.db_name_target)
            .bind(timestamp)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;

        let mut created = Vec::with_capacity(ids.len());
        for id in &ids {
            let event =
                sqlx::query_as::<_, SecurityEvent>("SELECT * FROM security_events WHERE id = ?")
                    .bind(id)
                    .fetch_one(pool)
                    .await?;
            created.push(event);
        }
        Ok(created)
    }

    /// Event log, newest first, with optional filters.
    pub async fn list(pool: &DbPool, filter: EventFilter) -> AppResult<Vec<SecurityEvent>> {
        let mut sql = String::from("SELECT * FROM security_events");
        let mut clauses = Vec::new();
        if filter.client_id.is_some() {
            clauses.push("client_id = ?");
        }
        if filter.event_type.is_some() {
            clauses.push("event_type = ?");
        }
        if filter.severity.is_some() {
            clauses.push("severity = ?");
        }
        if filter.start_date.is_some() {
            clauses.push("timestamp >= ?");
        }
        if filter.end_date.is_some() {
            clauses.push("timestamp <= ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, SecurityEvent>(&sql);
        if let Some(cid) = &filter.client_id {
            query = query.bind(cid);
        }
        if let Some(et) = &filter.event_type {
            query = query.bind(et);
        }
        if let Some(sev) = &filter.severity {
            query = query.bind(sev);
        }
        if let Some(start) = filter.start_date {
            query = query.bind(start);
        }
        if let Some(end) = filter.end_date {
            query = query.bind(end);
        }
        let events = query
            .bind(filter.limit)
            .bind(filter.skip)
            .fetch_all(pool)
            .await?;
        Ok(events)
    }
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_db(&pool).await.expect("Failed to init database");
    pool
}

/// Initialize database schema
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY,
            client_name TEXT UNIQUE NOT NULL,
            ip_address TEXT,
            os_info TEXT,
            status TEXT NOT NULL DEFAULT 'inactive',
            api_key_hash TEXT UNIQUE NOT NULL,
            registered_at DATETIME NOT NULL,
            last_heartbeat DATETIME
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS commands (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL REFERENCES clients(id),
            command_type TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending_dispatch',
            dispatch_deadline DATETIME,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            execution_result TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS security_events (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL REFERENCES clients(id),
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            source_ip TEXT,
            details TEXT,
            db_name_target TEXT,
            timestamp DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_commands_client_status ON commands(client_id, status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_commands_created_at ON commands(created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_client_id ON security_events(client_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON security_events(timestamp)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON security_events(event_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_severity ON security_events(severity)")
        .execute(pool)
        .await?;

    info!("Database migrations complete");
    Ok(())
}
