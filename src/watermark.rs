//! Global Xmin Calculation
//!
//! Every coordinator and data node periodically reports the oldest
//! transaction it still needs to see. The manager folds those reports into a
//! single cluster-wide global xmin, below which old row versions may be
//! reclaimed.
//!
//! Per node the calculation moves between three conditions:
//!
//! - **normal**: the reported xmin is trusted and must never go backwards.
//! - **idle**: the node reported "idle" with an unchanged xmin twice in a
//!   row. Its own value is ignored and a substitute is computed from the
//!   other nodes, first from non-idle nodes, then from idle ones.
//! - **excluded**: the node has not reported for longer than the staleness
//!   threshold. It does not hold back the global xmin, and may not rejoin
//!   with a non-idle report older than the current global xmin.
//!
//! The scan runs under a shared table lock so reporters proceed in
//! parallel; only the final commit takes the exclusive lock, and it only
//! ever moves the global xmin forward.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{elapsed_exceeds, Clock};
use crate::error::{Error, Result};
use crate::registry::{NodeType, Registry};
use crate::xid::TransactionId;

/// Default staleness threshold for xmin reports
pub const DEFAULT_REPORT_THRESHOLD: Duration = Duration::from_secs(120);

/// Source of the latest completed transaction id, which caps the global xmin
pub trait TransactionHorizon: Send + Sync {
    /// `INVALID` when no transaction has completed yet
    fn latest_completed_xid(&self) -> TransactionId;
}

/// Horizon updated by the embedding transaction service
#[derive(Debug, Default)]
pub struct SharedHorizon {
    latest_completed: AtomicU32,
}

impl SharedHorizon {
    pub fn new(latest_completed: TransactionId) -> Self {
        Self {
            latest_completed: AtomicU32::new(latest_completed.as_u32()),
        }
    }

    pub fn set_latest_completed(&self, xid: TransactionId) {
        self.latest_completed.store(xid.as_u32(), Ordering::Release);
    }
}

impl TransactionHorizon for SharedHorizon {
    fn latest_completed_xid(&self) -> TransactionId {
        TransactionId(self.latest_completed.load(Ordering::Acquire))
    }
}

/// Outcome of one xmin report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XminReport {
    /// Cluster global xmin after this report
    pub global_xmin: TransactionId,
    /// Xmin the node should adopt: its own report, or the substitute
    /// computed on its behalf when it is idle
    pub reported_xmin: TransactionId,
}

/// Computes the cluster global xmin from per-node reports
pub struct GlobalXminCalculator {
    registry: Arc<Registry>,
    horizon: Arc<dyn TransactionHorizon>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
}

impl GlobalXminCalculator {
    pub fn new(
        registry: Arc<Registry>,
        horizon: Arc<dyn TransactionHorizon>,
        clock: Arc<dyn Clock>,
        threshold: Duration,
    ) -> Self {
        Self {
            registry,
            horizon,
            clock,
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Handle one xmin report from a node and recompute the global xmin
    pub fn report(
        &self,
        node_type: NodeType,
        node_name: &str,
        reported_xmin: TransactionId,
        remote_idle: bool,
    ) -> Result<XminReport> {
        let table = self.registry.read();
        let current_global = table.global_xmin();

        tracing::debug!(
            "xmin report from {} {}: reported={} idle={} global={}",
            node_type,
            node_name,
            reported_xmin,
            remote_idle,
            current_global
        );

        let me = table
            .find(node_type, node_name)
            .ok_or_else(|| Error::NodeNotRegistered(format!("{} {}", node_type, node_name)))?;

        let now = self.clock.now();
        let my_idle = {
            let mut mine = me.write(&table);

            if mine.excluded && mine.reported_xmin.precedes(current_global) && !remote_idle {
                tracing::info!(
                    "Rejecting xmin report from excluded node {} {} (xmin {} behind global {})",
                    node_type,
                    node_name,
                    mine.reported_xmin,
                    current_global
                );
                return Err(Error::NodeExcluded(format!("{} {}", node_type, node_name)));
            }

            if !remote_idle && reported_xmin.precedes(mine.reported_xmin) {
                tracing::info!(
                    "Rejecting xmin {} from {} {}: precedes previous {}",
                    reported_xmin,
                    node_type,
                    node_name,
                    mine.reported_xmin
                );
                return Err(Error::XminTooOld {
                    node: format!("{} {}", node_type, node_name),
                    reported: reported_xmin.as_u32(),
                    previous: mine.reported_xmin.as_u32(),
                });
            }

            if remote_idle && mine.reported_xmin.equals(reported_xmin) {
                mine.idle = true;
            } else {
                mine.idle = false;
                mine.reported_xmin = reported_xmin;
            }
            mine.excluded = false;
            mine.reported_xmin_time = now;
            mine.idle
        };

        // Mark stale nodes excluded and collect both minima
        let mut non_idle_min = TransactionId::INVALID;
        let mut idle_min = TransactionId::INVALID;

        for node in table.nodes() {
            if !node.node_type().reports_xmin() {
                continue;
            }

            let stale = {
                let state = node.read(&table);
                if state.excluded {
                    continue;
                }
                elapsed_exceeds(state.reported_xmin_time, now, self.threshold)
            };
            if stale {
                let mut state = node.write(&table);
                if elapsed_exceeds(state.reported_xmin_time, now, self.threshold) {
                    tracing::info!(
                        "Node {} {} has not reported xmin since {}, excluding it from global xmin",
                        node.node_type(),
                        node.node_name(),
                        state.reported_xmin_time
                    );
                    state.excluded = true;
                    continue;
                }
            }

            // An idle reporter's own stale value must not feed its substitute
            if my_idle && Arc::ptr_eq(node, me) {
                continue;
            }

            let state = node.read(&table);
            if state.excluded {
                continue;
            }
            let xid = state.reported_xmin;
            let slot = if state.idle { &mut idle_min } else { &mut non_idle_min };
            if !slot.is_valid() || xid.precedes(*slot) {
                *slot = xid;
            }
        }

        let mut node_xmin = reported_xmin;
        if my_idle {
            let mut mine = me.write(&table);
            // The idle minimum only counts when no node is active; an idle
            // node must never run ahead of an active one
            if non_idle_min.is_valid() {
                if non_idle_min.follows(mine.reported_xmin) {
                    mine.reported_xmin = non_idle_min;
                }
            } else if idle_min.is_valid() && idle_min.follows(mine.reported_xmin) {
                mine.reported_xmin = idle_min;
            }
            node_xmin = mine.reported_xmin;
            mine.reported_xmin_time = now;
        }

        // Nothing in flight can be older than latest completed + 1
        let latest_completed = self.horizon.latest_completed_xid();
        let mut global_xmin = if latest_completed.is_valid() {
            latest_completed.advance()
        } else {
            TransactionId::FIRST_NORMAL
        };

        for node in table.nodes() {
            if !node.node_type().reports_xmin() {
                continue;
            }
            let state = node.read(&table);
            if state.excluded {
                continue;
            }
            global_xmin = global_xmin.older(state.reported_xmin);
        }
        drop(table);

        let committed = self.registry.write().advance_global_xmin(global_xmin, now);

        tracing::debug!(
            "global xmin computed={} committed={} for {} {}",
            global_xmin,
            committed,
            node_type,
            node_name
        );

        Ok(XminReport {
            global_xmin: committed,
            reported_xmin: node_xmin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{NodeRecord, Registration};

    struct Fixture {
        registry: Arc<Registry>,
        horizon: Arc<SharedHorizon>,
        clock: Arc<ManualClock>,
        calc: GlobalXminCalculator,
    }

    fn fixture(latest_completed: u32) -> Fixture {
        let registry = Arc::new(Registry::new());
        let horizon = Arc::new(SharedHorizon::new(TransactionId(latest_completed)));
        let clock = Arc::new(ManualClock::default());
        let calc = GlobalXminCalculator::new(
            Arc::clone(&registry),
            horizon.clone(),
            clock.clone(),
            DEFAULT_REPORT_THRESHOLD,
        );
        Fixture {
            registry,
            horizon,
            clock,
            calc,
        }
    }

    impl Fixture {
        fn register(&self, node_type: NodeType, name: &str, xmin: u32) {
            let mut reg = Registration::new(node_type, name);
            reg.reported_xmin = TransactionId(xmin);
            self.registry
                .add(NodeRecord::new(reg, self.clock.now()))
                .unwrap();
        }

        fn report(&self, name: &str, xmin: u32, idle: bool) -> Result<XminReport> {
            self.calc.report(NodeType::Datanode, name, TransactionId(xmin), idle)
        }

        fn node(&self, name: &str) -> crate::registry::NodeInfo {
            self.registry.info(NodeType::Datanode, name).unwrap()
        }
    }

    #[test]
    fn test_two_datanode_scenario() {
        let f = fixture(200);
        f.register(NodeType::Datanode, "dn1", 100);
        f.register(NodeType::Datanode, "dn2", 100);

        assert_eq!(f.report("dn1", 100, false).unwrap().global_xmin, TransactionId(100));
        assert_eq!(f.report("dn2", 100, false).unwrap().global_xmin, TransactionId(100));

        // dn2 still holds the watermark back
        assert_eq!(f.report("dn1", 150, false).unwrap().global_xmin, TransactionId(100));
        assert_eq!(f.report("dn2", 150, false).unwrap().global_xmin, TransactionId(150));
        assert_eq!(f.registry.global_xmin(), TransactionId(150));
    }

    #[test]
    fn test_capped_by_latest_completed() {
        let f = fixture(120);
        f.register(NodeType::Datanode, "dn1", 100);
        let report = f.report("dn1", 500, false).unwrap();
        assert_eq!(report.global_xmin, TransactionId(121));
        assert_eq!(report.reported_xmin, TransactionId(500));

        f.horizon.set_latest_completed(TransactionId(450));
        let report = f.report("dn1", 500, false).unwrap();
        assert_eq!(report.global_xmin, TransactionId(451));
    }

    #[test]
    fn test_no_completed_transaction_uses_floor() {
        let f = fixture(0);
        f.register(NodeType::Datanode, "dn1", 100);
        let report = f.report("dn1", 100, false).unwrap();
        assert_eq!(report.global_xmin, TransactionId::FIRST_NORMAL);
    }

    #[test]
    fn test_unregistered_node_rejected() {
        let f = fixture(200);
        let err = f.report("ghost", 100, false).unwrap_err();
        assert!(matches!(err, Error::NodeNotRegistered(_)));
    }

    #[test]
    fn test_regressing_xmin_rejected_without_mutation() {
        let f = fixture(200);
        f.register(NodeType::Datanode, "dn1", 100);
        f.report("dn1", 150, false).unwrap();
        let before = f.node("dn1");

        f.clock.advance(Duration::from_secs(5));
        let err = f.report("dn1", 140, false).unwrap_err();
        assert!(matches!(err, Error::XminTooOld { reported: 140, previous: 150, .. }));

        let after = f.node("dn1");
        assert_eq!(after.reported_xmin, TransactionId(150));
        assert_eq!(after.reported_xmin_time, before.reported_xmin_time);
    }

    #[test]
    fn test_proxies_do_not_hold_back_global_xmin() {
        let f = fixture(1000);
        f.register(NodeType::Proxy, "proxy1", 10);
        f.register(NodeType::Datanode, "dn1", 100);
        let report = f.report("dn1", 300, false).unwrap();
        assert_eq!(report.global_xmin, TransactionId(300));
    }

    #[test]
    fn test_idle_node_gets_non_idle_substitute() {
        let f = fixture(1000);
        f.register(NodeType::Datanode, "dn1", 100);
        f.register(NodeType::Datanode, "dn2", 100);
        f.report("dn2", 400, false).unwrap();

        // First idle report stores the value, second identical one marks idle
        let first = f.report("dn1", 120, true).unwrap();
        assert_eq!(first.reported_xmin, TransactionId(120));
        assert!(!f.node("dn1").idle);

        let second = f.report("dn1", 120, true).unwrap();
        assert!(f.node("dn1").idle);
        assert_eq!(second.reported_xmin, TransactionId(400));
        assert_eq!(f.node("dn1").reported_xmin, TransactionId(400));
        assert_eq!(second.global_xmin, TransactionId(400));
    }

    #[test]
    fn test_idle_substitute_never_regresses() {
        let f = fixture(1000);
        f.register(NodeType::Datanode, "dn1", 100);
        f.register(NodeType::Datanode, "dn2", 100);
        f.report("dn2", 150, false).unwrap();
        f.report("dn1", 300, false).unwrap();

        f.report("dn1", 300, true).unwrap();
        let report = f.report("dn1", 300, true).unwrap();
        // dn2 at 150 is older than dn1's own 300; keep 300
        assert_eq!(report.reported_xmin, TransactionId(300));
        assert_eq!(f.node("dn1").reported_xmin, TransactionId(300));
    }

    #[test]
    fn test_idle_node_stays_behind_active_node() {
        let f = fixture(1000);
        for name in ["dn1", "dn2", "dn3"] {
            f.register(NodeType::Datanode, name, 100);
        }
        f.report("dn3", 150, false).unwrap();

        f.report("dn2", 400, true).unwrap();
        f.report("dn2", 400, true).unwrap();
        assert!(f.node("dn2").idle);

        f.report("dn1", 300, false).unwrap();
        let report = f.report("dn1", 300, true).unwrap();
        // dn3 is active at 150, so idle dn2 at 400 must not pull dn1 ahead
        assert!(f.node("dn1").idle);
        assert_eq!(report.reported_xmin, TransactionId(300));
        assert_eq!(f.node("dn1").reported_xmin, TransactionId(300));
        assert_eq!(report.global_xmin, TransactionId(150));
    }

    #[test]
    fn test_all_idle_falls_back_to_idle_minimum() {
        let f = fixture(1000);
        f.register(NodeType::Datanode, "dn1", 100);
        f.register(NodeType::Datanode, "dn2", 100);

        f.report("dn2", 250, true).unwrap();
        f.report("dn2", 250, true).unwrap();
        assert!(f.node("dn2").idle);

        // dn1 repeats its stored value, so it goes idle straight away
        let report = f.report("dn1", 100, true).unwrap();
        assert!(f.node("dn1").idle);
        assert_eq!(report.reported_xmin, TransactionId(250));
        assert_eq!(report.global_xmin, TransactionId(250));
    }

    #[test]
    fn test_stale_node_excluded_and_must_catch_up() {
        let f = fixture(1000);
        f.register(NodeType::Datanode, "dn1", 100);
        f.register(NodeType::Datanode, "dn2", 100);
        f.report("dn1", 100, false).unwrap();

        f.clock.advance(Duration::from_secs(121));
        let report = f.report("dn2", 300, false).unwrap();
        assert!(f.node("dn1").excluded);
        assert_eq!(report.global_xmin, TransactionId(300));

        // dn1 is behind the new global xmin and not idle
        let err = f.report("dn1", 200, false).unwrap_err();
        assert!(matches!(err, Error::NodeExcluded(_)));
        assert!(f.node("dn1").excluded);

        // An idle report lets it back in
        let report = f.report("dn1", 100, true).unwrap();
        assert!(!f.node("dn1").excluded);
        assert!(f.node("dn1").idle);
        assert_eq!(report.reported_xmin, TransactionId(300));
        assert_eq!(report.global_xmin, TransactionId(300));
    }

    #[test]
    fn test_excluded_node_rejoins_when_global_has_not_moved() {
        let f = fixture(1000);
        f.register(NodeType::Datanode, "dn1", 100);
        f.register(NodeType::Datanode, "dn2", 100);
        f.report("dn1", 100, false).unwrap();

        f.clock.advance(Duration::from_secs(121));
        f.report("dn2", 100, false).unwrap();
        assert!(f.node("dn1").excluded);

        let report = f.report("dn1", 110, false).unwrap();
        assert!(!f.node("dn1").excluded);
        assert_eq!(report.global_xmin, TransactionId(100));
    }

    #[test]
    fn test_global_xmin_monotonic_under_concurrent_reports() {
        let f = fixture(100_000);
        for i in 0..4 {
            f.register(NodeType::Datanode, &format!("dn{}", i), 100);
        }
        let calc = Arc::new(f.calc);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let calc = Arc::clone(&calc);
                std::thread::spawn(move || {
                    let name = format!("dn{}", i);
                    let mut last_seen = TransactionId::FIRST_NORMAL;
                    for step in 1..200u32 {
                        let report = calc
                            .report(NodeType::Datanode, &name, TransactionId(100 + step * 10), false)
                            .unwrap();
                        assert!(last_seen.precedes_or_equals(report.global_xmin));
                        last_seen = report.global_xmin;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(f.registry.global_xmin(), TransactionId(100 + 199 * 10));
    }
}
