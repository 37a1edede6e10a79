//! Deployment state machine and the durable record that survives a
//! reboot (spec.md §4.5.1, §4.5.2).

use serde::{Deserialize, Serialize};

/// The deployment lifecycle (spec.md §4.5.2). The happy path runs
/// `Download -> Install -> Reboot -> AfterReboot -> Commit -> Cleanup`;
/// a deployment whose payloads all report `needs_reboot = false` skips
/// straight from `Install` to `Commit`. Any step may instead fall
/// through to the rollback branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    Download,
    Install,
    Reboot,
    AfterReboot,
    Commit,
    Cleanup,
    Failure,
    Rollback,
    RollbackReboot,
    AfterRollbackReboot,
    FailureReported,
}

impl DeploymentState {
    /// True once the deployment has reached a terminal outcome and its
    /// record is eligible for clearing (spec.md §8 invariant 6).
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentState::Cleanup | DeploymentState::FailureReported)
    }
}

/// The status reported to the service over `PUT
/// /deployments/{id}/status` (spec.md §4.5.5). A strict subset of
/// [`DeploymentState`]: several internal states (e.g. `AfterReboot`)
/// report the same external status as the state that precedes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Downloading,
    Installing,
    Installed,
    Rebooting,
    Success,
    Failure,
    AlreadyInstalled,
    Aborted,
}

impl From<DeploymentState> for Option<DeploymentStatus> {
    fn from(state: DeploymentState) -> Self {
        match state {
            DeploymentState::Download => Some(DeploymentStatus::Downloading),
            DeploymentState::Install => Some(DeploymentStatus::Installing),
            DeploymentState::Reboot | DeploymentState::RollbackReboot => {
                Some(DeploymentStatus::Rebooting)
            }
            DeploymentState::AfterReboot
            | DeploymentState::Commit
            | DeploymentState::AfterRollbackReboot => None,
            DeploymentState::Cleanup => Some(DeploymentStatus::Success),
            DeploymentState::Failure | DeploymentState::Rollback => {
                Some(DeploymentStatus::Failure)
            }
            DeploymentState::FailureReported => None,
        }
    }
}

/// Per-payload bookkeeping (spec.md §3): one entry per artifact payload
/// discovered while unpacking the artifact (`header.tar`'s per-index
/// `type-info`). Drives whether the engine can skip the reboot branch
/// and whether a failed install can be rolled back automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub payload_type: String,
    pub payload_index: u32,
    pub needs_reboot: bool,
    pub rollback_supported: bool,
    /// Keys the payload's handler stored transient state under, so a
    /// rollback or commit can find and clear it (spec.md §3
    /// `state_data_store`).
    pub state_data_store: Vec<String>,
}

/// The durable record persisted to `StoreKey::DeploymentData`
/// (spec.md §3, §4.5.1) so an in-flight deployment survives a crash or
/// reboot. `pending_slot_name` lets the engine recognize, after a
/// reboot, which image it just booted into. `payloads` is empty until
/// `run_install` unpacks the artifact's header and learns what it
/// contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployment_id: String,
    pub artifact_name: String,
    pub source_uri: String,
    pub state: DeploymentState,
    pub pending_slot_name: Option<String>,
    pub payloads: Vec<PayloadRecord>,
}

impl DeploymentRecord {
    pub fn new(
        deployment_id: impl Into<String>,
        artifact_name: impl Into<String>,
        source_uri: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            artifact_name: artifact_name.into(),
            source_uri: source_uri.into(),
            state: DeploymentState::Download,
            pending_slot_name: None,
            payloads: Vec::new(),
        }
    }

    pub fn status(&self) -> Option<DeploymentStatus> {
        self.state.into()
    }

    /// Whether any unpacked payload requires a reboot to take effect
    /// (spec.md §4.5.2 step 6: "if needs_reboot is false, advance
    /// straight to COMMIT"). Defaults to `true` before the artifact is
    /// unpacked, so the engine doesn't skip the reboot branch on a
    /// record it hasn't inspected yet.
    pub fn needs_reboot(&self) -> bool {
        self.payloads.is_empty() || self.payloads.iter().any(|p| p.needs_reboot)
    }

    /// Whether every unpacked payload can be rolled back automatically
    /// (spec.md §4.5.1 item 7). A payload that can't forces the
    /// deployment straight to `FailureReported` instead of the
    /// rollback/reboot branch.
    pub fn rollback_supported(&self) -> bool {
        !self.payloads.is_empty() && self.payloads.iter().all(|p| p.rollback_supported)
    }
}
