//! Node status transitions.
//!
//! ```text
//! PENDING -> PROVISIONING -> ONLINE | ERROR
//! ONLINE   --fail--> DEGRADED (still scraped) --N consecutive fails--> ERROR (unscraped)
//! DEGRADED --ok--> ONLINE
//! ERROR    --ok--> ONLINE
//! ```
//!
//! PENDING and PROVISIONING only move through the provisioning path.

use super::node::NodeStatus;

/// Status and failure counter to record, valid only while the node is still in `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: NodeStatus,
    pub status: NodeStatus,
    pub consecutive_failures: u32,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        self.status != self.from
    }
}

/// Fold one scheduled probe verdict into the node's status.
///
/// Returns `None` for statuses the reconciler does not own.
pub fn after_probe(
    current: NodeStatus,
    consecutive_failures: u32,
    online: bool,
    failure_threshold: u32,
) -> Option<Transition> {
    if !current.is_probed() {
        return None;
    }

    if online {
        return Some(Transition {
            from: current,
            status: NodeStatus::Online,
            consecutive_failures: 0,
        });
    }

    let failures = consecutive_failures.saturating_add(1);
    let status = match current {
        NodeStatus::Error => NodeStatus::Error,
        _ if failures >= failure_threshold.max(1) => NodeStatus::Error,
        _ => NodeStatus::Degraded,
    };
    Some(Transition {
        from: current,
        status,
        consecutive_failures: failures,
    })
}

/// Enter PROVISIONING from PENDING, or from ERROR/PROVISIONING on a manual retry.
pub fn start_provisioning(current: NodeStatus) -> Option<Transition> {
    matches!(
        current,
        NodeStatus::Pending | NodeStatus::Provisioning | NodeStatus::Error
    )
    .then_some(Transition {
        from: current,
        status: NodeStatus::Provisioning,
        consecutive_failures: 0,
    })
}

/// Status after the provisioner reported success and the immediate post-install probe ran.
pub fn after_install(online: bool) -> Transition {
    if online {
        Transition {
            from: NodeStatus::Provisioning,
            status: NodeStatus::Online,
            consecutive_failures: 0,
        }
    } else {
        Transition {
            from: NodeStatus::Provisioning,
            status: NodeStatus::Error,
            consecutive_failures: 1,
        }
    }
}

/// Status after the provisioner failed or timed out, or a stuck install expired.
pub fn after_failed_install() -> Transition {
    Transition {
        from: NodeStatus::Provisioning,
        status: NodeStatus::Error,
        consecutive_failures: 0,
    }
}
