//! ProxySQL admin adapter.
//!
//! Talks to the admin interface (port 6032 by default) with `mysql_async`.
//! The admin interface has no prepared statements, so every mutating
//! statement is bound client-side by [`AdminStatement`]. Each statement runs
//! under `statement_timeout`; the first failure aborts the rest of the call.

use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use orchestrator_shared_types::Result;
use query_router_interface::{
    desired_servers, AdminRotation, AdminStatement, BackendServer, BootstrapOutcome, HostgroupIds,
    QueryRouter, RouterEndpoint, RouterError, RouterTarget, RouterWeights, RoutingConfig,
    OP_ADD_REPLICA, OP_APPLY_TOPOLOGY, OP_BOOTSTRAP_ADMIN, OP_CONFIGURE_ROUTING, OP_REMOVE_SERVER,
    OP_ROUTING_TABLE, OP_UPDATE_MASTER,
};

const LOAD_SERVERS: &str = "LOAD MYSQL SERVERS TO RUNTIME";
const SAVE_SERVERS: &str = "SAVE MYSQL SERVERS TO DISK";

#[derive(Debug, Clone)]
pub struct ProxySqlConfig {
    pub hostgroups: HostgroupIds,
    pub weights: RouterWeights,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
}

impl Default for ProxySqlConfig {
    fn default() -> Self {
        Self {
            hostgroups: HostgroupIds::default(),
            weights: RouterWeights::default(),
            connect_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ProxySqlRouter {
    config: ProxySqlConfig,
}

impl ProxySqlRouter {
    pub fn new(config: ProxySqlConfig) -> Self {
        Self { config }
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &SecretString,
    ) -> std::result::Result<Conn, RouterError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(host.to_string())
            .tcp_port(port)
            .user(Some(user.to_string()))
            .pass(Some(password.expose_secret().clone()))
            .prefer_socket(false)
            // The admin interface cannot answer the session probes a client would otherwise send
            .max_allowed_packet(Some(16 * 1024 * 1024))
            .wait_timeout(Some(28_800))
            .stmt_cache_size(0);

        match tokio::time::timeout(self.config.connect_timeout, Conn::new(opts)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(RouterError::Connection(format!("{}:{}: {}", host, port, e))),
            Err(_) => Err(RouterError::Timeout(self.config.connect_timeout)),
        }
    }

    async fn connect_endpoint(&self, endpoint: &RouterEndpoint) -> std::result::Result<Conn, RouterError> {
        self.connect(
            &endpoint.host,
            endpoint.admin_port,
            &endpoint.admin_user,
            &endpoint.admin_password,
        )
        .await
    }

    /// Runs `statements` in order on one connection.
    async fn run_statements(
        &self,
        conn: &mut Conn,
        statements: &[AdminStatement],
    ) -> std::result::Result<(), RouterError> {
        for statement in statements {
            let sql = statement.render()?;
            debug!(statement = ?statement, "router admin statement");
            match tokio::time::timeout(self.config.statement_timeout, conn.query_drop(sql)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(RouterError::Statement {
                        statement: statement.template().to_string(),
                        message: e.to_string(),
                    })
                }
                Err(_) => return Err(RouterError::Timeout(self.config.statement_timeout)),
            }
        }
        Ok(())
    }

    /// Connects, runs the batch and disconnects. Errors carry `operation`.
    async fn execute(
        &self,
        operation: &str,
        endpoint: &RouterEndpoint,
        statements: Vec<AdminStatement>,
    ) -> Result<()> {
        info!(
            cluster_id = %endpoint.cluster_id,
            operation,
            statements = statements.len(),
            "applying router change"
        );
        let result = async {
            let mut conn = self.connect_endpoint(endpoint).await?;
            let outcome = self.run_statements(&mut conn, &statements).await;
            if let Err(e) = conn.disconnect().await {
                debug!("router admin disconnect failed: {}", e);
            }
            outcome
        }
        .await;

        result.map_err(|e| {
            warn!(cluster_id = %endpoint.cluster_id, operation, error = %e, "router operation failed");
            e.into_operation_error(operation, endpoint.cluster_id)
        })
    }

    fn upsert(&self, hostgroup_id: u32, target: &RouterTarget, weight: u32) -> AdminStatement {
        AdminStatement::new(
            "REPLACE INTO mysql_servers (hostgroup_id, hostname, port, weight, status) VALUES (?, ?, ?, ?, 'ONLINE')",
        )
        .bind(hostgroup_id)
        .bind(target.hostname.as_str())
        .bind(target.port)
        .bind(weight)
    }

    /// Copies the writer into an empty reader group.
    fn backfill_readers(&self) -> AdminStatement {
        let hg = self.config.hostgroups;
        AdminStatement::new(
            "INSERT INTO mysql_servers (hostgroup_id, hostname, port, weight, status) \
             SELECT ?, hostname, port, ?, 'ONLINE' FROM mysql_servers WHERE hostgroup_id = ? \
             AND NOT EXISTS (SELECT 1 FROM mysql_servers WHERE hostgroup_id = ?)",
        )
        .bind(hg.reader)
        .bind(self.config.weights.reader)
        .bind(hg.writer)
        .bind(hg.reader)
    }

    pub fn apply_topology_statements(&self, write: &RouterTarget, reads: &[RouterTarget]) -> Vec<AdminStatement> {
        let hg = self.config.hostgroups;
        let desired = desired_servers(hg, self.config.weights, write, reads);

        let readers: Vec<&BackendServer> = desired.iter().filter(|s| s.hostgroup_id == hg.reader).collect();
        let placeholders = vec!["?"; readers.len()].join(", ");

        let mut delete_stale_readers = AdminStatement::new(format!(
            "DELETE FROM mysql_servers WHERE hostgroup_id = ? AND hostname NOT IN ({})",
            placeholders
        ))
        .bind(hg.reader);
        for server in &readers {
            delete_stale_readers = delete_stale_readers.bind(server.hostname.as_str());
        }

        let mut statements = vec![
            AdminStatement::new("DELETE FROM mysql_servers WHERE hostgroup_id = ? AND hostname <> ?")
                .bind(hg.writer)
                .bind(write.hostname.as_str()),
            delete_stale_readers,
        ];
        for server in &desired {
            let target = RouterTarget {
                hostname: server.hostname.clone(),
                port: server.port,
            };
            statements.push(self.upsert(server.hostgroup_id, &target, server.weight));
        }
        statements.push(AdminStatement::plain(LOAD_SERVERS));
        statements.push(AdminStatement::plain(SAVE_SERVERS));
        statements
    }

    pub fn add_replica_statements(&self, target: &RouterTarget) -> Vec<AdminStatement> {
        let hg = self.config.hostgroups;
        vec![
            self.upsert(hg.reader, target, self.config.weights.reader),
            // A writer standing in for missing replicas leaves the reader group
            AdminStatement::new(
                "DELETE FROM mysql_servers WHERE hostgroup_id = ? AND hostname <> ? \
                 AND hostname IN (SELECT hostname FROM mysql_servers WHERE hostgroup_id = ?)",
            )
            .bind(hg.reader)
            .bind(target.hostname.as_str())
            .bind(hg.writer),
            AdminStatement::plain(LOAD_SERVERS),
            AdminStatement::plain(SAVE_SERVERS),
        ]
    }

    pub fn remove_server_statements(&self, hostname: &str) -> Vec<AdminStatement> {
        vec![
            AdminStatement::new("DELETE FROM mysql_servers WHERE hostname = ?").bind(hostname),
            self.backfill_readers(),
            AdminStatement::plain(LOAD_SERVERS),
            AdminStatement::plain(SAVE_SERVERS),
        ]
    }

    pub fn update_master_statements(&self, new_primary: &RouterTarget) -> Vec<AdminStatement> {
        let hg = self.config.hostgroups;
        vec![
            AdminStatement::new("DELETE FROM mysql_servers WHERE hostgroup_id = ?").bind(hg.writer),
            AdminStatement::new("DELETE FROM mysql_servers WHERE hostgroup_id = ? AND hostname = ?")
                .bind(hg.reader)
                .bind(new_primary.hostname.as_str()),
            self.upsert(hg.writer, new_primary, self.config.weights.writer),
            self.backfill_readers(),
            AdminStatement::plain(LOAD_SERVERS),
            AdminStatement::plain(SAVE_SERVERS),
        ]
    }

    pub fn configure_routing_statements(&self, config: &RoutingConfig) -> Vec<AdminStatement> {
        let hg = self.config.hostgroups;
        vec![
            AdminStatement::new(
                "UPDATE global_variables SET variable_value = ? WHERE variable_name = 'mysql-monitor_username'",
            )
            .bind(config.monitor_user.as_str()),
            AdminStatement::new(
                "UPDATE global_variables SET variable_value = ? WHERE variable_name = 'mysql-monitor_password'",
            )
            .bind(config.monitor_password.expose_secret().as_str())
            .sensitive(),
            AdminStatement::plain("LOAD MYSQL VARIABLES TO RUNTIME"),
            AdminStatement::plain("SAVE MYSQL VARIABLES TO DISK"),
            AdminStatement::new(
                "REPLACE INTO mysql_users (username, password, default_hostgroup, active) VALUES (?, ?, ?, 1)",
            )
            .bind(config.app_user.as_str())
            .bind(config.app_password.expose_secret().as_str())
            .bind(hg.writer)
            .sensitive(),
            AdminStatement::plain("LOAD MYSQL USERS TO RUNTIME"),
            AdminStatement::plain("SAVE MYSQL USERS TO DISK"),
            AdminStatement::plain("DELETE FROM mysql_query_rules WHERE rule_id IN (1, 2)"),
            AdminStatement::new(
                "INSERT INTO mysql_query_rules (rule_id, active, match_digest, destination_hostgroup, apply) \
                 VALUES (1, 1, '^SELECT.*FOR UPDATE', ?, 1), (2, 1, '^SELECT', ?, 1)",
            )
            .bind(hg.writer)
            .bind(hg.reader),
            AdminStatement::plain("LOAD MYSQL QUERY RULES TO RUNTIME"),
            AdminStatement::plain("SAVE MYSQL QUERY RULES TO DISK"),
        ]
    }

    fn rotation_statements(&self, user: &str, new_password: &SecretString) -> Vec<AdminStatement> {
        let credentials = format!(
            "admin:{pw};{user}:{pw}",
            pw = new_password.expose_secret(),
            user = user
        );
        vec![
            AdminStatement::new(
                "UPDATE global_variables SET variable_value = ? WHERE variable_name = 'admin-admin_credentials'",
            )
            .bind(credentials)
            .sensitive(),
            AdminStatement::plain("LOAD ADMIN VARIABLES TO RUNTIME"),
            AdminStatement::plain("SAVE ADMIN VARIABLES TO DISK"),
        ]
    }
}

#[async_trait]
impl QueryRouter for ProxySqlRouter {
    async fn bootstrap_admin(
        &self,
        endpoint: &RouterEndpoint,
        rotation: &AdminRotation,
    ) -> Result<BootstrapOutcome> {
        if rotation.already_rotated {
            return Ok(BootstrapOutcome::AlreadyRotated);
        }

        let op_err = |e: RouterError| e.into_operation_error(OP_BOOTSTRAP_ADMIN, endpoint.cluster_id);
        let mut conn = match self
            .connect(
                &endpoint.host,
                endpoint.admin_port,
                &rotation.default_user,
                &rotation.default_password,
            )
            .await
        {
            Ok(conn) => conn,
            Err(default_err) => {
                // The rotated credential may already be live even if it was never recorded
                let probe = self
                    .connect(
                        &endpoint.host,
                        endpoint.admin_port,
                        &rotation.default_user,
                        &rotation.new_password,
                    )
                    .await;
                return match probe {
                    Ok(conn) => {
                        let _ = conn.disconnect().await;
                        info!(cluster_id = %endpoint.cluster_id, "router admin credential already rotated");
                        Ok(BootstrapOutcome::AlreadyRotated)
                    }
                    Err(_) => Err(op_err(default_err)),
                };
            }
        };

        let statements = self.rotation_statements(&rotation.default_user, &rotation.new_password);
        let outcome = self.run_statements(&mut conn, &statements).await;
        let _ = conn.disconnect().await;
        outcome.map_err(op_err)?;
        info!(cluster_id = %endpoint.cluster_id, "router admin credential rotated");
        Ok(BootstrapOutcome::Rotated)
    }

    async fn configure_routing(&self, endpoint: &RouterEndpoint, config: &RoutingConfig) -> Result<()> {
        self.execute(OP_CONFIGURE_ROUTING, endpoint, self.configure_routing_statements(config))
            .await
    }

    async fn apply_topology(
        &self,
        endpoint: &RouterEndpoint,
        write: &RouterTarget,
        reads: &[RouterTarget],
    ) -> Result<()> {
        self.execute(OP_APPLY_TOPOLOGY, endpoint, self.apply_topology_statements(write, reads))
            .await
    }

    async fn add_replica(&self, endpoint: &RouterEndpoint, target: &RouterTarget) -> Result<()> {
        self.execute(OP_ADD_REPLICA, endpoint, self.add_replica_statements(target))
            .await
    }

    async fn remove_server(&self, endpoint: &RouterEndpoint, hostname: &str) -> Result<()> {
        query_router_interface::validate_hostname(hostname)
            .map_err(|e| e.into_operation_error(OP_REMOVE_SERVER, endpoint.cluster_id))?;
        self.execute(OP_REMOVE_SERVER, endpoint, self.remove_server_statements(hostname))
            .await
    }

    async fn update_master(&self, endpoint: &RouterEndpoint, new_primary: &RouterTarget) -> Result<()> {
        self.execute(OP_UPDATE_MASTER, endpoint, self.update_master_statements(new_primary))
            .await
    }

    async fn routing_table(&self, endpoint: &RouterEndpoint) -> Result<Vec<BackendServer>> {
        let op_err = |e: RouterError| e.into_operation_error(OP_ROUTING_TABLE, endpoint.cluster_id);
        let mut conn = self.connect_endpoint(endpoint).await.map_err(op_err)?;
        let query = conn.query::<(u32, String, u16, u32, String), _>(
            "SELECT hostgroup_id, hostname, port, weight, status FROM runtime_mysql_servers \
             ORDER BY hostgroup_id, hostname",
        );
        let rows = match tokio::time::timeout(self.config.statement_timeout, query).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                return Err(op_err(RouterError::Statement {
                    statement: "SELECT ... FROM runtime_mysql_servers".to_string(),
                    message: e.to_string(),
                }))
            }
            Err(_) => return Err(op_err(RouterError::Timeout(self.config.statement_timeout))),
        };
        let _ = conn.disconnect().await;

        Ok(rows
            .into_iter()
            .map(|(hostgroup_id, hostname, port, weight, status)| BackendServer {
                hostgroup_id,
                hostname,
                port,
                weight,
                status,
            })
            .collect())
    }
}
