//! MySQL replication wiring, done through `exec` inside the containers.
//!
//! The root password travels in `MYSQL_PWD`, never on the command line.
//! Every statement with a user-influenced value is bound through
//! [`AdminStatement`].

use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use container_runtime_interface::{
    poll_until_ready, ContainerRuntime, HealthCheck, ReadinessPolicy, ReadyPoll,
};
use orchestrator_shared_types::{ContainerId, OrchestrationError, Result};
use query_router_interface::AdminStatement;

use crate::credentials::OpenedCredentials;

/// Server id of the primary; replicas use `REPLICA_SERVER_ID_BASE + ordinal`.
pub const PRIMARY_SERVER_ID: u32 = 1;
pub const REPLICA_SERVER_ID_BASE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub fn parse(version: &str) -> Result<Self> {
        let invalid = || OrchestrationError::Validation(format!("invalid engine version {:?}", version));
        let mut parts = version.trim().split('.');
        let mut next = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { major, minor, patch })
    }

    /// `CHANGE REPLICATION SOURCE` / `START REPLICA` exist from 8.0.23 on.
    pub fn has_source_syntax(&self) -> bool {
        *self
            >= (EngineVersion {
                major: 8,
                minor: 0,
                patch: 23,
            })
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn bind_error(err: query_router_interface::RouterError) -> OrchestrationError {
    OrchestrationError::InternalError(format!("statement binding failed: {}", err))
}

/// `mysqld` flags for a database node.
pub fn mysqld_args(server_id: u32, replica: bool) -> Vec<String> {
    let mut args = vec![
        format!("--server-id={}", server_id),
        "--log-bin=mysql-bin".to_string(),
        "--binlog-format=ROW".to_string(),
        "--gtid-mode=ON".to_string(),
        "--enforce-gtid-consistency=ON".to_string(),
        "--log-slave-updates=ON".to_string(),
        "--skip-name-resolve".to_string(),
    ];
    if replica {
        args.push("--relay-log=relay-bin".to_string());
        args.push("--read-only=ON".to_string());
        args.push("--super-read-only=ON".to_string());
    }
    args
}

pub fn mysql_health_check() -> HealthCheck {
    HealthCheck {
        command: vec![
            "mysqladmin".to_string(),
            "ping".to_string(),
            "-h127.0.0.1".to_string(),
            "--silent".to_string(),
        ],
        interval: Duration::from_secs(2),
        retries: 30,
    }
}

/// Users the primary needs: replication, router monitor and application.
/// Replicas inherit them through the binlog.
pub fn primary_user_statements(creds: &OpenedCredentials) -> Result<String> {
    let statements = [
        AdminStatement::new("CREATE USER IF NOT EXISTS ?@'%' IDENTIFIED BY ?")
            .bind(creds.replication_user.as_str())
            .bind(creds.replication_password.expose_secret().as_str()),
        AdminStatement::new("GRANT REPLICATION SLAVE, REPLICATION CLIENT ON *.* TO ?@'%'")
            .bind(creds.replication_user.as_str()),
        AdminStatement::new(
            "CREATE USER IF NOT EXISTS ?@'%' IDENTIFIED WITH mysql_native_password BY ?",
        )
        .bind(creds.monitor_user.as_str())
        .bind(creds.monitor_password.expose_secret().as_str()),
        AdminStatement::new("GRANT USAGE, REPLICATION CLIENT ON *.* TO ?@'%'")
            .bind(creds.monitor_user.as_str()),
        AdminStatement::new(
            "CREATE USER IF NOT EXISTS ?@'%' IDENTIFIED WITH mysql_native_password BY ?",
        )
        .bind(creds.app_user.as_str())
        .bind(creds.app_password.expose_secret().as_str()),
        AdminStatement::new("GRANT ALL PRIVILEGES ON *.* TO ?@'%'").bind(creds.app_user.as_str()),
        AdminStatement::plain("FLUSH PRIVILEGES"),
    ];
    render_script(&statements)
}

/// Points a replica at `source_host` with GTID auto-positioning and starts it.
pub fn replica_setup_statements(
    version: EngineVersion,
    source_host: &str,
    source_port: u16,
    creds: &OpenedCredentials,
) -> Result<String> {
    let (change, start) = if version.has_source_syntax() {
        (
            "CHANGE REPLICATION SOURCE TO SOURCE_HOST = ?, SOURCE_PORT = ?, SOURCE_USER = ?, \
             SOURCE_PASSWORD = ?, SOURCE_AUTO_POSITION = 1, GET_SOURCE_PUBLIC_KEY = 1",
            "START REPLICA",
        )
    } else {
        (
            "CHANGE MASTER TO MASTER_HOST = ?, MASTER_PORT = ?, MASTER_USER = ?, \
             MASTER_PASSWORD = ?, MASTER_AUTO_POSITION = 1, GET_MASTER_PUBLIC_KEY = 1",
            "START SLAVE",
        )
    };
    let statements = [
        AdminStatement::new(change)
            .bind(source_host)
            .bind(source_port)
            .bind(creds.replication_user.as_str())
            .bind(creds.replication_password.expose_secret().as_str())
            .sensitive(),
        AdminStatement::plain(start),
    ];
    render_script(&statements)
}

pub fn replica_status_statement(version: EngineVersion) -> &'static str {
    if version.has_source_syntax() {
        "SHOW REPLICA STATUS\\G"
    } else {
        "SHOW SLAVE STATUS\\G"
    }
}

fn render_script(statements: &[AdminStatement]) -> Result<String> {
    let rendered = statements
        .iter()
        .map(|s| s.render().map_err(bind_error))
        .collect::<Result<Vec<_>>>()?;
    Ok(rendered.join("; "))
}

/// State of one replication thread as reported by `SHOW REPLICA STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Connecting,
    Stopped,
}

impl ThreadState {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "Yes" => ThreadState::Running,
            "Connecting" => ThreadState::Connecting,
            _ => ThreadState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaThreads {
    pub io: ThreadState,
    pub sql: ThreadState,
}

impl ReplicaThreads {
    /// Parses vertical (`\G`) output. Empty output means replication was
    /// never configured.
    pub fn parse(output: &str) -> Self {
        let mut threads = ReplicaThreads {
            io: ThreadState::Stopped,
            sql: ThreadState::Stopped,
        };
        for line in output.lines() {
            let Some((key, value)) = line.trim().split_once(':') else {
                continue;
            };
            match key.trim() {
                "Replica_IO_Running" | "Slave_IO_Running" => threads.io = ThreadState::parse(value),
                "Replica_SQL_Running" | "Slave_SQL_Running" => {
                    threads.sql = ThreadState::parse(value)
                }
                _ => {}
            }
        }
        threads
    }

    pub fn is_replicating(&self) -> bool {
        self.io == ThreadState::Running && self.sql == ThreadState::Running
    }

    /// Applying or about to apply the source's changes.
    pub fn is_syncing(&self) -> bool {
        self.sql == ThreadState::Running && self.io != ThreadState::Stopped
    }
}

/// The `mysql` client inside a database container, logged in as root.
pub struct MysqlShell<'a> {
    runtime: &'a dyn ContainerRuntime,
    container_id: &'a ContainerId,
    root_password: &'a SecretString,
}

impl<'a> MysqlShell<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        container_id: &'a ContainerId,
        root_password: &'a SecretString,
    ) -> Self {
        Self {
            runtime,
            container_id,
            root_password,
        }
    }

    /// Runs `sql` and returns stdout. A non-zero exit is an error carrying stderr.
    pub async fn run(&self, sql: &str) -> Result<String> {
        let command = vec![
            "mysql".to_string(),
            "-uroot".to_string(),
            "-h127.0.0.1".to_string(),
            "--batch".to_string(),
            "-e".to_string(),
            sql.to_string(),
        ];
        let env = vec![(
            "MYSQL_PWD".to_string(),
            self.root_password.expose_secret().clone(),
        )];
        let output = self.runtime.exec(self.container_id, &command, &env).await?;
        if !output.success() {
            return Err(OrchestrationError::RuntimeError(format!(
                "mysql in {} exited with {}: {}",
                self.container_id,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    pub async fn replica_threads(&self, version: EngineVersion) -> Result<ReplicaThreads> {
        let stdout = self.run(replica_status_statement(version)).await?;
        Ok(ReplicaThreads::parse(&stdout))
    }

    /// Polls replica status until it is syncing. `Ok(false)` on timeout.
    pub async fn wait_syncing(&self, version: EngineVersion, policy: ReadinessPolicy) -> Result<bool> {
        let outcome = poll_until_ready(policy, || async move {
            match self.replica_threads(version).await {
                Ok(threads) if threads.is_syncing() => ReadyPoll::Ready,
                Ok(threads) => {
                    debug!(container_id = %self.container_id, ?threads, "replica not syncing yet");
                    ReadyPoll::NotReadyYet
                }
                Err(_) => ReadyPoll::NotReadyYet,
            }
        })
        .await;
        Ok(outcome == ReadyPoll::Ready)
    }
}
