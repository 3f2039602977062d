//! Node Manager
//!
//! Request handling for node registration, xmin reporting and session
//! tracking. Owns the registry, the register log and the global xmin
//! calculator, and queues accepted state changes for the standby.
//!
//! Register log failures are logged and swallowed: the in-memory registry is
//! authoritative for the running process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::config::GtmConfig;
use crate::error::{Error, Result};
use crate::protocol::{Request, Response};
use crate::registry::{
    BackendId, ConnectionId, NodeInfo, NodeRecord, NodeStatus, NodeType, ProcessId, Registration, Registry,
};
use crate::reglog::{LogRecord, RegisterEntry, RegisterLog};
use crate::standby::StandbyForwarder;
use crate::watermark::{GlobalXminCalculator, TransactionHorizon, XminReport};
use crate::xid::TransactionId;

/// Node registry service
pub struct NodeManager {
    registry: Arc<Registry>,
    log: RegisterLog,
    calculator: GlobalXminCalculator,
    clock: Arc<dyn Clock>,
    standby: Option<StandbyForwarder>,
    /// Cap on nodes returned by enumeration
    max_nodes: usize,
    /// Whether `forwarded` registrations from the primary are honoured
    accept_forwarded: bool,
    shutting_down: AtomicBool,
}

impl NodeManager {
    pub fn new(
        log: RegisterLog,
        horizon: Arc<dyn TransactionHorizon>,
        clock: Arc<dyn Clock>,
        xmin_report_threshold: Duration,
        max_nodes: usize,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let calculator = GlobalXminCalculator::new(
            Arc::clone(&registry),
            horizon,
            Arc::clone(&clock),
            xmin_report_threshold,
        );

        Self {
            registry,
            log,
            calculator,
            clock,
            standby: None,
            max_nodes,
            accept_forwarded: false,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Manager on the system clock, configured from `config`
    pub fn from_config(config: &GtmConfig, horizon: Arc<dyn TransactionHorizon>) -> Self {
        Self::new(
            RegisterLog::new(config.register_log_path()),
            horizon,
            Arc::new(SystemClock),
            config.registry.xmin_report_threshold(),
            config.registry.max_nodes,
        )
        .accept_forwarded(config.standby.accept_forwarded)
    }

    /// Run as a standby: registrations flagged as forwarded by the primary
    /// are stored without an owning connection. Off by default, so a client
    /// cannot register a node no connection owns.
    pub fn accept_forwarded(mut self, accept: bool) -> Self {
        self.accept_forwarded = accept;
        self
    }

    /// Forward accepted state changes to a standby manager
    pub fn with_standby(mut self, forwarder: StandbyForwarder) -> Self {
        self.standby = Some(forwarder);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn register_log(&self) -> &RegisterLog {
        &self.log
    }

    // ========== Registration ==========

    /// Register a node, or reconnect a disconnected one.
    ///
    /// Returns the xmin the node starts from: its reported xmin, or the
    /// current global xmin when it reported none.
    pub fn register_node(&self, registration: Registration) -> Result<TransactionId> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        RegisterEntry::from_registration(&registration).validate()?;

        let record = NodeRecord::new(registration.clone(), self.clock.now());
        let outcome = self.registry.add(record)?;

        tracing::info!(
            "{} {} {} (port {}, xmin {})",
            if outcome.reconnected { "Reconnected" } else { "Registered" },
            registration.node_type,
            registration.node_name,
            registration.port,
            outcome.reported_xmin
        );

        self.log_registration(registration.node_type, &registration.node_name);
        self.forward_registration(registration);

        Ok(outcome.reported_xmin)
    }

    /// Remove a node from the registry
    pub fn unregister_node(&self, node_type: NodeType, node_name: &str) -> Result<()> {
        {
            let mut table = self.registry.write();
            let record = table
                .find(node_type, node_name)
                .cloned()
                .ok_or_else(|| Error::UnknownNode(format!("{} {}", node_type, node_name)))?;
            table.remove(&record);
        }

        tracing::info!("Unregistered {} {}", node_type, node_name);

        if let Err(e) = self.log.append_unregister(node_type, node_name) {
            tracing::warn!("Failed to log unregistration of {} {}: {}", node_type, node_name, e);
        }

        self.forward(Request::UnregisterNode {
            node_type,
            node_name: node_name.to_string(),
        });
        Ok(())
    }

    /// Mark a node disconnected at the request of its postmaster.
    ///
    /// Only the connection that owns the registration may disconnect it;
    /// a node restored from the log or applied from the primary has no owner.
    pub fn backend_disconnect(
        &self,
        is_postmaster: bool,
        node_type: NodeType,
        node_name: &str,
        conn: ConnectionId,
    ) -> Result<()> {
        if !is_postmaster {
            return Ok(());
        }

        {
            let table = self.registry.read();
            let record = table
                .find(node_type, node_name)
                .ok_or_else(|| Error::UnknownNode(format!("{} {}", node_type, node_name)))?;

            let mut state = record.write(&table);
            if let Some(owner) = state.socket {
                if owner != conn {
                    tracing::info!(
                        "Rejecting disconnect of {} {} from {}: owned by {}",
                        node_type,
                        node_name,
                        conn,
                        owner
                    );
                    return Err(Error::ConnectionMismatch(format!("{} {}", node_type, node_name)));
                }
            }
            state.status = NodeStatus::Disconnected;
            state.socket = None;
        }

        tracing::info!("Disconnected {} {}", node_type, node_name);

        self.forward(Request::BackendDisconnect {
            is_postmaster,
            node_type,
            node_name: node_name.to_string(),
        });
        Ok(())
    }

    /// Mark every node owned by a closed connection disconnected.
    /// Returns how many nodes were affected.
    pub fn connection_closed(&self, conn: ConnectionId) -> usize {
        let mut released = Vec::new();
        {
            let table = self.registry.read();
            for node in table.nodes() {
                let mut state = node.write(&table);
                if state.socket == Some(conn) {
                    state.status = NodeStatus::Disconnected;
                    state.socket = None;
                    released.push((node.node_type(), node.node_name().to_string()));
                }
            }
        }

        for (node_type, node_name) in released.iter() {
            tracing::info!("Connection {} lost, {} {} disconnected", conn, node_type, node_name);
            self.forward(Request::BackendDisconnect {
                is_postmaster: true,
                node_type: *node_type,
                node_name: node_name.clone(),
            });
        }
        released.len()
    }

    /// Attach a backend session to a coordinator, registering a placeholder
    /// coordinator first if it is not known yet.
    ///
    /// Returns the process id that previously held `backend_id`, which the
    /// caller should terminate.
    pub fn register_coordinator_process(
        &self,
        node_name: &str,
        proc_id: ProcessId,
        backend_id: BackendId,
    ) -> Result<Option<ProcessId>> {
        let placeholder = Registration::new(NodeType::Coordinator, node_name);
        RegisterEntry::from_registration(&placeholder).validate()?;

        loop {
            {
                let table = self.registry.read();
                if let Some(record) = table.find(NodeType::Coordinator, node_name) {
                    let mut state = record.write(&table);
                    let conflicting = state.sessions.register(proc_id, backend_id)?;
                    if let Some(pid) = conflicting {
                        tracing::info!(
                            "Backend {} on {} reused by pid {}, previous pid {}",
                            backend_id,
                            node_name,
                            proc_id,
                            pid
                        );
                    }
                    return Ok(conflicting);
                }
            }

            match self.registry.add(NodeRecord::new(placeholder.clone(), self.clock.now())) {
                Ok(_) => {
                    tracing::info!("Registered placeholder coordinator {}", node_name);
                    self.log_registration(NodeType::Coordinator, node_name);
                    self.forward_registration(placeholder.clone());
                }
                // Lost a registration race; look it up again
                Err(Error::AlreadyExists(_)) => {}
                Err(e) => {
                    tracing::warn!("Failed to register placeholder coordinator {}: {}", node_name, e);
                    return Ok(None);
                }
            }
        }
    }

    // ========== Global Xmin ==========

    pub fn report_xmin(
        &self,
        node_type: NodeType,
        node_name: &str,
        reported_xmin: TransactionId,
        idle: bool,
    ) -> Result<XminReport> {
        self.calculator.report(node_type, node_name, reported_xmin, idle)
    }

    /// Current global xmin and when it last advanced
    pub fn global_xmin(&self) -> (TransactionId, Option<DateTime<Utc>>) {
        let table = self.registry.read();
        (table.global_xmin(), table.global_xmin_computed_at())
    }

    // ========== Status ==========

    /// Registered nodes, optionally of one type, up to the configured cap
    pub fn list_nodes(&self, node_type: Option<NodeType>) -> Vec<NodeInfo> {
        self.registry.infos(node_type, self.max_nodes)
    }

    // ========== Lifecycle ==========

    /// Rebuild the registry from the register log. Restored nodes are
    /// disconnected until they register again. Returns the number of nodes.
    pub fn recover(&self) -> Result<usize> {
        let replay = self.log.replay()?;
        let now = self.clock.now();

        for record in replay.records {
            let mut table = self.registry.write();
            match record {
                LogRecord::Register(entry) => {
                    // The latest registration of a node wins
                    if let Some(existing) = table.find(entry.node_type, &entry.node_name).cloned() {
                        table.remove(&existing);
                    }
                    table.add(NodeRecord::new(entry.into_registration(), now))?;
                }
                LogRecord::Unregister { node_type, node_name } => {
                    match table.find(node_type, &node_name).cloned() {
                        Some(existing) => {
                            table.remove(&existing);
                        }
                        None => {
                            tracing::debug!("Log unregisters unknown node {} {}", node_type, node_name);
                        }
                    }
                }
            }
        }

        let restored = self.registry.len();
        tracing::info!("Recovered {} nodes from {}", restored, self.log.path().display());
        Ok(restored)
    }

    /// Stop accepting registrations and compact the register log
    pub fn shutdown(&self) -> Result<usize> {
        self.shutting_down.store(true, Ordering::Release);
        self.log.save_snapshot(&self.registry)
    }

    // ========== Dispatch ==========

    /// Handle one request from connection `conn`
    pub fn handle(&self, conn: ConnectionId, request: Request) -> Response {
        let name = request.type_name();

        let result = match request {
            Request::RegisterNode {
                mut registration,
                forwarded,
            } => {
                registration.socket = if forwarded && self.accept_forwarded {
                    None
                } else {
                    if forwarded {
                        tracing::warn!(
                            "Ignoring forwarded flag on {} {} from {}: not a standby",
                            registration.node_type,
                            registration.node_name,
                            conn
                        );
                    }
                    Some(conn)
                };
                self.register_node(registration)
                    .map(|xmin| Response::Registered { xmin })
            }
            Request::UnregisterNode {
                node_type,
                node_name,
            } => self
                .unregister_node(node_type, &node_name)
                .map(|()| Response::Unregistered),
            Request::BackendDisconnect {
                is_postmaster,
                node_type,
                node_name,
            } => self
                .backend_disconnect(is_postmaster, node_type, &node_name, conn)
                .map(|()| Response::Disconnected),
            Request::RegisterCoordinatorProcess {
                node_name,
                proc_id,
                backend_id,
            } => self
                .register_coordinator_process(&node_name, proc_id, backend_id)
                .map(|conflicting_pid| Response::CoordinatorProcessRegistered { conflicting_pid }),
            Request::ReportXmin {
                node_type,
                node_name,
                reported_xmin,
                idle,
            } => self
                .report_xmin(node_type, &node_name, reported_xmin, idle)
                .map(|report| Response::XminReported {
                    global_xmin: report.global_xmin,
                    reported_xmin: report.reported_xmin,
                }),
            Request::GlobalXmin => {
                let (global_xmin, computed_at) = self.global_xmin();
                Ok(Response::GlobalXmin {
                    global_xmin,
                    computed_at,
                })
            }
            Request::ListNodes { node_type } => Ok(Response::Nodes {
                nodes: self.list_nodes(node_type),
            }),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{} from {} failed: {}", name, conn, e);
                Response::from_error(&e)
            }
        }
    }

    /// Append the node as it now stands in the registry. A reconnect keeps
    /// fields the new registration left out, so the incoming request is not
    /// what gets logged.
    fn log_registration(&self, node_type: NodeType, node_name: &str) {
        let entry = {
            let table = self.registry.read();
            let Some(record) = table.find(node_type, node_name) else {
                return;
            };
            let state = record.read(&table);
            RegisterEntry::from_state(node_type, node_name, &state)
        };

        if let Err(e) = self.log.append(&LogRecord::Register(entry)) {
            tracing::warn!("Failed to log registration of {} {}: {}", node_type, node_name, e);
        }
    }

    fn forward_registration(&self, mut registration: Registration) {
        registration.socket = None;
        self.forward(Request::RegisterNode {
            registration,
            forwarded: true,
        });
    }

    fn forward(&self, request: Request) {
        if let Some(standby) = &self.standby {
            standby.forward(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::ErrorCode;
    use crate::standby::{RetryPolicy, StandbyLink};
    use crate::watermark::{SharedHorizon, DEFAULT_REPORT_THRESHOLD};
    use std::path::Path;
    use tempfile::tempdir;

    fn manager_at(path: &Path) -> NodeManager {
        NodeManager::new(
            RegisterLog::new(path),
            Arc::new(SharedHorizon::new(TransactionId(200))),
            Arc::new(ManualClock::default()),
            DEFAULT_REPORT_THRESHOLD,
            1024,
        )
    }

    fn datanode(name: &str, conn: u64) -> Registration {
        let mut reg = Registration::new(NodeType::Datanode, name);
        reg.port = 15432;
        reg.ip_address = Some("10.0.0.5".into());
        reg.data_folder = Some(format!("/data/{}", name));
        reg.socket = Some(ConnectionId(conn));
        reg
    }

    #[test]
    fn test_duplicate_then_reconnect() {
        let dir = tempdir().unwrap();
        let manager = manager_at(&dir.path().join("register.node"));

        manager.register_node(datanode("dn1", 1)).unwrap();
        let err = manager.register_node(datanode("dn1", 2)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        manager
            .backend_disconnect(true, NodeType::Datanode, "dn1", ConnectionId(1))
            .unwrap();

        let mut again = datanode("dn1", 2);
        again.port = 15433;
        manager.register_node(again).unwrap();

        let nodes = manager.list_nodes(Some(NodeType::Datanode));
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Connected);
        assert_eq!(nodes[0].port, 15433);
        assert_eq!(nodes[0].connection, Some(ConnectionId(2)));
    }

    #[test]
    fn test_register_defaults_xmin_to_global() {
        let dir = tempdir().unwrap();
        let manager = manager_at(&dir.path().join("register.node"));

        let xmin = manager.register_node(datanode("dn1", 1)).unwrap();
        assert_eq!(xmin, TransactionId::FIRST_NORMAL);

        let mut reg = datanode("dn2", 2);
        reg.reported_xmin = TransactionId(90);
        assert_eq!(manager.register_node(reg).unwrap(), TransactionId(90));
    }

    #[test]
    fn test_unregister_unknown_node() {
        let dir = tempdir().unwrap();
        let manager = manager_at(&dir.path().join("register.node"));

        let err = manager.unregister_node(NodeType::Proxy, "proxy1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownNode);

        manager.register_node(datanode("dn1", 1)).unwrap();
        manager.unregister_node(NodeType::Datanode, "dn1").unwrap();
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_backend_disconnect_rules() {
        let dir = tempdir().unwrap();
        let manager = manager_at(&dir.path().join("register.node"));
        manager.register_node(datanode("dn1", 1)).unwrap();

        // Not from the postmaster: nothing happens
        manager
            .backend_disconnect(false, NodeType::Datanode, "dn1", ConnectionId(9))
            .unwrap();
        assert_eq!(
            manager.registry().info(NodeType::Datanode, "dn1").unwrap().status,
            NodeStatus::Connected
        );

        let err = manager
            .backend_disconnect(true, NodeType::Datanode, "dn1", ConnectionId(9))
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionMismatch(_)));

        let err = manager
            .backend_disconnect(true, NodeType::Datanode, "ghost", ConnectionId(1))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownNode(_)));

        manager
            .backend_disconnect(true, NodeType::Datanode, "dn1", ConnectionId(1))
            .unwrap();
        let info = manager.registry().info(NodeType::Datanode, "dn1").unwrap();
        assert_eq!(info.status, NodeStatus::Disconnected);
        assert_eq!(info.connection, None);
    }

    #[test]
    fn test_connection_closed_releases_owned_nodes() {
        let dir = tempdir().unwrap();
        let manager = manager_at(&dir.path().join("register.node"));
        manager.register_node(datanode("dn1", 1)).unwrap();
        manager.register_node(datanode("dn2", 1)).unwrap();
        manager.register_node(datanode("dn3", 2)).unwrap();

        assert_eq!(manager.connection_closed(ConnectionId(1)), 2);
        assert_eq!(manager.connection_closed(ConnectionId(1)), 0);

        let disconnected: Vec<_> = manager
            .list_nodes(None)
            .into_iter()
            .filter(|n| n.status == NodeStatus::Disconnected)
            .map(|n| n.node_name)
            .collect();
        assert_eq!(disconnected.len(), 2);
        assert!(!disconnected.contains(&"dn3".to_string()));
    }

    #[test]
    fn test_coordinator_process_registration() {
        let dir = tempdir().unwrap();
        let manager = manager_at(&dir.path().join("register.node"));

        // Unknown coordinator gets a placeholder record
        assert_eq!(manager.register_coordinator_process("coord1", 1001, 1).unwrap(), None);
        let info = manager.registry().info(NodeType::Coordinator, "coord1").unwrap();
        assert_eq!(info.port, 0);
        assert_eq!(info.status, NodeStatus::Connected);
        assert_eq!(info.sessions, 1);

        assert_eq!(manager.register_coordinator_process("coord1", 1001, 1).unwrap(), None);
        assert_eq!(manager.register_coordinator_process("coord1", 2002, 1).unwrap(), Some(1001));
        assert_eq!(
            manager.registry().info(NodeType::Coordinator, "coord1").unwrap().sessions,
            1
        );

        // The placeholder survives a restart like any registration
        let restarted = manager_at(manager.register_log().path());
        assert_eq!(restarted.recover().unwrap(), 1);
        let info = restarted.registry().info(NodeType::Coordinator, "coord1").unwrap();
        assert_eq!(info.status, NodeStatus::Disconnected);
        assert_eq!(info.sessions, 0);

        let err = manager.register_coordinator_process("", 3003, 2).unwrap_err();
        assert!(matches!(err, Error::InvalidRegistration(_)));
    }

    #[test]
    fn test_unloggable_registration_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("register.node");

        {
            let manager = manager_at(&path);
            manager.register_node(datanode("dn1", 1)).unwrap();
            let err = manager.register_node(datanode("", 1)).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidRegistration);

            let mut huge = datanode("dn2", 1);
            huge.data_folder = Some("x".repeat(2 * 1024 * 1024));
            match manager.handle(
                ConnectionId(1),
                Request::RegisterNode {
                    registration: huge,
                    forwarded: false,
                },
            ) {
                Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRegistration),
                other => panic!("unexpected response {:?}", other),
            }

            manager.register_node(datanode("dn3", 1)).unwrap();
            assert_eq!(manager.registry().len(), 2);
        }

        // Nothing unreadable reached the log, so records after it survive
        let manager = manager_at(&path);
        assert_eq!(manager.recover().unwrap(), 2);
        assert!(manager.registry().info(NodeType::Datanode, "dn3").is_some());
    }

    #[test]
    fn test_forwarded_flag_needs_standby_role() {
        let dir = tempdir().unwrap();
        let primary = manager_at(&dir.path().join("primary.node"));
        let standby = manager_at(&dir.path().join("standby.node")).accept_forwarded(true);

        for manager in [&primary, &standby] {
            let response = manager.handle(
                ConnectionId(4),
                Request::RegisterNode {
                    registration: Registration::new(NodeType::Datanode, "dn1"),
                    forwarded: true,
                },
            );
            assert!(matches!(response, Response::Registered { .. }));
        }

        let owned = primary.registry().info(NodeType::Datanode, "dn1").unwrap();
        assert_eq!(owned.connection, Some(ConnectionId(4)));
        let err = primary
            .backend_disconnect(true, NodeType::Datanode, "dn1", ConnectionId(5))
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionMismatch(_)));

        let applied = standby.registry().info(NodeType::Datanode, "dn1").unwrap();
        assert_eq!(applied.connection, None);
    }

    #[test]
    fn test_reconnect_logs_merged_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("register.node");

        {
            let manager = manager_at(&path);
            manager.register_node(datanode("dn1", 1)).unwrap();
            manager.connection_closed(ConnectionId(1));

            let mut bare = datanode("dn1", 2);
            bare.ip_address = None;
            bare.data_folder = None;
            bare.port = 15433;
            manager.register_node(bare).unwrap();
        }

        let manager = manager_at(&path);
        manager.recover().unwrap();
        let info = manager.registry().info(NodeType::Datanode, "dn1").unwrap();
        assert_eq!(info.port, 15433);
        assert_eq!(info.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(info.data_folder.as_deref(), Some("/data/dn1"));
    }

    #[test]
    fn test_recover_restores_disconnected_nodes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("register.node");

        {
            let manager = manager_at(&path);
            manager.register_node(datanode("dn1", 1)).unwrap();
            manager.register_node(datanode("dn2", 1)).unwrap();
            manager.connection_closed(ConnectionId(1));
            let mut moved = datanode("dn1", 3);
            moved.ip_address = Some("10.0.0.99".into());
            manager.register_node(moved).unwrap();
            manager.unregister_node(NodeType::Datanode, "dn2").unwrap();
        }

        let manager = manager_at(&path);
        assert_eq!(manager.recover().unwrap(), 1);

        let info = manager.registry().info(NodeType::Datanode, "dn1").unwrap();
        assert_eq!(info.status, NodeStatus::Disconnected);
        assert_eq!(info.connection, None);
        assert_eq!(info.ip_address.as_deref(), Some("10.0.0.99"));
        assert!(manager.registry().info(NodeType::Datanode, "dn2").is_none());

        // Restored nodes rejoin as reconnects
        manager.register_node(datanode("dn1", 7)).unwrap();
        assert_eq!(manager.registry().len(), 1);
    }

    #[test]
    fn test_shutdown_snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("register.node");

        let manager = manager_at(&path);
        for i in 0..4 {
            manager.register_node(datanode(&format!("dn{}", i), 1)).unwrap();
        }
        manager.unregister_node(NodeType::Datanode, "dn0").unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        assert_eq!(manager.shutdown().unwrap(), 3);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        assert!(matches!(
            manager.register_node(datanode("dn9", 1)),
            Err(Error::ShuttingDown)
        ));

        let restored = manager_at(&path);
        assert_eq!(restored.recover().unwrap(), 3);
    }

    #[test]
    fn test_log_failure_does_not_fail_registration() {
        let dir = tempdir().unwrap();
        let manager = manager_at(&dir.path().join("missing").join("register.node"));

        manager.register_node(datanode("dn1", 1)).unwrap();
        manager.unregister_node(NodeType::Datanode, "dn1").unwrap();
    }

    #[test]
    fn test_end_to_end_watermark_through_dispatch() {
        let dir = tempdir().unwrap();
        let manager = manager_at(&dir.path().join("register.node"));
        let conn = ConnectionId(1);

        for name in ["dn1", "dn2"] {
            let mut registration = Registration::new(NodeType::Datanode, name);
            registration.reported_xmin = TransactionId(100);
            let response = manager.handle(
                conn,
                Request::RegisterNode {
                    registration,
                    forwarded: false,
                },
            );
            assert!(matches!(response, Response::Registered { xmin } if xmin == TransactionId(100)));
        }

        let report = |name: &str, xmin: u32| {
            match manager.handle(
                conn,
                Request::ReportXmin {
                    node_type: NodeType::Datanode,
                    node_name: name.into(),
                    reported_xmin: TransactionId(xmin),
                    idle: false,
                },
            ) {
                Response::XminReported { global_xmin, .. } => global_xmin,
                other => panic!("unexpected response {:?}", other),
            }
        };

        assert_eq!(report("dn1", 100), TransactionId(100));
        assert_eq!(report("dn2", 100), TransactionId(100));
        assert_eq!(report("dn1", 150), TransactionId(100));
        assert_eq!(report("dn2", 150), TransactionId(150));

        match manager.handle(conn, Request::GlobalXmin) {
            Response::GlobalXmin { global_xmin, computed_at } => {
                assert_eq!(global_xmin, TransactionId(150));
                assert!(computed_at.is_some());
            }
            other => panic!("unexpected response {:?}", other),
        }

        match manager.handle(
            conn,
            Request::ReportXmin {
                node_type: NodeType::Datanode,
                node_name: "dn1".into(),
                reported_xmin: TransactionId(120),
                idle: false,
            },
        ) {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::TooOldXmin),
            other => panic!("unexpected response {:?}", other),
        }
    }

    struct RecordingLink {
        sent: parking_lot::Mutex<Vec<Request>>,
    }

    #[async_trait::async_trait]
    impl StandbyLink for RecordingLink {
        async fn send(&self, request: Request) -> Result<Response> {
            self.sent.lock().push(request);
            Ok(Response::Unregistered)
        }
    }

    #[tokio::test]
    async fn test_state_changes_forwarded_to_standby() {
        let dir = tempdir().unwrap();
        let link = Arc::new(RecordingLink {
            sent: parking_lot::Mutex::new(Vec::new()),
        });
        let (forwarder, handle) = StandbyForwarder::spawn(link.clone(), RetryPolicy::default());
        let manager = manager_at(&dir.path().join("register.node")).with_standby(forwarder);

        manager.register_node(datanode("dn1", 1)).unwrap();
        manager
            .backend_disconnect(true, NodeType::Datanode, "dn1", ConnectionId(1))
            .unwrap();
        manager.unregister_node(NodeType::Datanode, "dn1").unwrap();
        // Rejected operations are not forwarded
        assert!(manager.unregister_node(NodeType::Datanode, "dn1").is_err());
        manager.register_coordinator_process("coord1", 1001, 1).unwrap();

        drop(manager);
        handle.await.unwrap();

        let sent = link.sent.lock();
        let names: Vec<_> = sent.iter().map(|r| r.type_name()).collect();
        assert_eq!(
            names,
            vec!["RegisterNode", "BackendDisconnect", "UnregisterNode", "RegisterNode"]
        );
        match &sent[0] {
            Request::RegisterNode {
                registration,
                forwarded,
            } => {
                assert!(*forwarded);
                assert_eq!(registration.socket, None);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
