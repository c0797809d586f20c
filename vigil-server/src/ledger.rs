use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ServerError, ServerResult};

/// Lifecycle of a queued command. Status only ever moves forward:
/// pending -> sent -> running -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Running,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommandStatus::Pending),
            "sent" => Some(CommandStatus::Sent),
            "running" => Some(CommandStatus::Running),
            "completed" => Some(CommandStatus::Completed),
            "failed" => Some(CommandStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

/// The wire shape delivered to an agent inside its poll response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: i64,
    pub command: String,
    pub args: String,
}

/// Full command record as stored by the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub id: i64,
    pub hostname: String,
    pub command: String,
    pub args: String,
    pub status: CommandStatus,
    pub output: String,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// Host row kept current by status pushes.
#[derive(Debug, Clone, Serialize)]
pub struct HostRecord {
    pub id: i64,
    pub hostname: String,
    pub agent_version: Option<String>,
    pub os_name: Option<String>,
    pub kernel: Option<String>,
    pub arch: Option<String>,
    pub cpu_percent: f64,
    pub cpu_count: i64,
    pub ram_total_mb: f64,
    pub ram_used_mb: f64,
    pub ram_percent: f64,
    pub uptime_seconds: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Gauges reported alongside a status push, denormalized onto the host row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostGauges {
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub cpu_count: i64,
    #[serde(default)]
    pub ram_total_mb: f64,
    #[serde(default)]
    pub ram_used_mb: f64,
    #[serde(default)]
    pub ram_percent: f64,
    #[serde(default)]
    pub uptime_seconds: i64,
}

/// Durable store of hosts and command records.
///
/// A single SQLite connection guarded by a mutex. Pop-and-mark-sent runs as
/// one transaction under that lock, which is what makes delivery at-most-once
/// even when two polls for the same host race.
pub struct CommandLedger {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hosts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    hostname        TEXT NOT NULL UNIQUE,
    agent_version   TEXT,
    os_name         TEXT,
    kernel          TEXT,
    arch            TEXT,
    cpu_percent     REAL NOT NULL DEFAULT 0,
    cpu_count       INTEGER NOT NULL DEFAULT 1,
    ram_total_mb    REAL NOT NULL DEFAULT 0,
    ram_used_mb     REAL NOT NULL DEFAULT 0,
    ram_percent     REAL NOT NULL DEFAULT 0,
    uptime_seconds  INTEGER NOT NULL DEFAULT 0,
    first_seen      TEXT NOT NULL,
    last_seen       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS commands (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id     INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    command     TEXT NOT NULL,
    args        TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL DEFAULT 'pending',
    output      TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    executed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_commands_host_status ON commands(host_id, status);
";

impl CommandLedger {
    pub fn open(path: &Path) -> ServerResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory ledger, used by tests.
    pub fn open_in_memory() -> ServerResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> ServerResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert the host row on a status push. Returns the host id.
    pub fn observe_host(&self, hostname: &str, gauges: &HostGauges) -> ServerResult<i64> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO hosts (hostname, first_seen, last_seen) VALUES (?1, ?2, ?2)
             ON CONFLICT(hostname) DO UPDATE SET last_seen = ?2",
            params![hostname, now],
        )?;
        conn.execute(
            "UPDATE hosts SET agent_version = COALESCE(?2, agent_version),
                 os_name = COALESCE(?3, os_name), kernel = COALESCE(?4, kernel),
                 arch = COALESCE(?5, arch), cpu_percent = ?6, cpu_count = ?7,
                 ram_total_mb = ?8, ram_used_mb = ?9, ram_percent = ?10,
                 uptime_seconds = ?11
             WHERE hostname = ?1",
            params![
                hostname,
                gauges.agent_version,
                gauges.os_name,
                gauges.kernel,
                gauges.arch,
                gauges.cpu_percent,
                gauges.cpu_count,
                gauges.ram_total_mb,
                gauges.ram_used_mb,
                gauges.ram_percent,
                gauges.uptime_seconds,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM hosts WHERE hostname = ?1",
            params![hostname],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Queue a command for a host. Fails if the host has never checked in.
    pub fn enqueue(&self, hostname: &str, command: &str, args: &str) -> ServerResult<i64> {
        let conn = self.conn.lock();
        let host_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM hosts WHERE hostname = ?1",
                params![hostname],
                |row| row.get(0),
            )
            .optional()?;
        let host_id =
            host_id.ok_or_else(|| ServerError::NotFound(format!("host '{}'", hostname)))?;

        conn.execute(
            "INSERT INTO commands (host_id, command, args, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![host_id, command, args, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Queued command {} ({}) for {}", id, command, hostname);
        Ok(id)
    }

    /// Atomically take the pending set for a host, marking every returned
    /// record `sent` in the same transaction. A command handed out here is
    /// never handed out again.
    pub fn pop_pending(&self, hostname: &str) -> ServerResult<Vec<CommandEnvelope>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let envelopes = {
            let mut stmt = tx.prepare(
                "SELECT c.id, c.command, c.args FROM commands c
                 JOIN hosts h ON h.id = c.host_id
                 WHERE h.hostname = ?1 AND c.status = 'pending'
                 ORDER BY c.id",
            )?;
            let rows = stmt.query_map(params![hostname], |row| {
                Ok(CommandEnvelope {
                    id: row.get(0)?,
                    command: row.get(1)?,
                    args: row.get(2)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for env in &envelopes {
            tx.execute(
                "UPDATE commands SET status = 'sent' WHERE id = ?1",
                params![env.id],
            )?;
        }
        tx.commit()?;

        if !envelopes.is_empty() {
            debug!("Dispatching {} command(s) to {}", envelopes.len(), hostname);
        }
        Ok(envelopes)
    }

    /// Record an agent-reported result. Idempotent: later reports overwrite
    /// earlier ones. An unknown id is a soft failure (returns false).
    pub fn record_result(
        &self,
        id: i64,
        status: CommandStatus,
        output: &str,
    ) -> ServerResult<bool> {
        let conn = self.conn.lock();
        let executed_at = if status.is_terminal() {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        let updated = conn.execute(
            "UPDATE commands SET status = ?2, output = ?3,
                 executed_at = COALESCE(?4, executed_at)
             WHERE id = ?1",
            params![id, status.as_str(), output, executed_at],
        )?;
        if updated == 0 {
            warn!("Result report for unknown command id {}", id);
            return Ok(false);
        }
        Ok(true)
    }

    pub fn get_status(&self, id: i64) -> ServerResult<Option<CommandRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT c.id, h.hostname, c.command, c.args, c.status, c.output,
                        c.created_at, c.executed_at
                 FROM commands c JOIN hosts h ON h.id = c.host_id
                 WHERE c.id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;

        Ok(record.map(
            |(id, hostname, command, args, status, output, created_at, executed_at)| {
                CommandRecord {
                    id,
                    hostname,
                    command,
                    args,
                    status: CommandStatus::parse(&status).unwrap_or(CommandStatus::Failed),
                    output,
                    created_at: parse_timestamp(&created_at),
                    executed_at: executed_at.as_deref().map(parse_timestamp),
                }
            },
        ))
    }

    pub fn list_hosts(&self) -> ServerResult<Vec<HostRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, hostname, agent_version, os_name, kernel, arch, cpu_percent,
                    cpu_count, ram_total_mb, ram_used_mb, ram_percent, uptime_seconds,
                    first_seen, last_seen
             FROM hosts ORDER BY hostname",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(HostRecord {
                id: row.get(0)?,
                hostname: row.get(1)?,
                agent_version: row.get(2)?,
                os_name: row.get(3)?,
                kernel: row.get(4)?,
                arch: row.get(5)?,
                cpu_percent: row.get(6)?,
                cpu_count: row.get(7)?,
                ram_total_mb: row.get(8)?,
                ram_used_mb: row.get(9)?,
                ram_percent: row.get(10)?,
                uptime_seconds: row.get(11)?,
                first_seen: parse_timestamp(&row.get::<_, String>(12)?),
                last_seen: parse_timestamp(&row.get::<_, String>(13)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_host(&self, hostname: &str) -> ServerResult<Option<HostRecord>> {
        Ok(self
            .list_hosts()?
            .into_iter()
            .find(|h| h.hostname == hostname))
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
