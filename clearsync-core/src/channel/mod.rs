//! Channel lifecycle: create, fund, resize and close one channel per wallet,
//! keeping the coordinator's ledger and the custody contract in step.

pub mod app_session;
pub mod lifecycle;

pub use app_session::AppSessions;
pub use lifecycle::{ChannelLifecycle, LifecycleParams};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fine-grained progress of the lifecycle state machine.
///
/// `Failed` keeps the step it failed at, so a persisted record says exactly
/// where an operator has to pick up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum LifecyclePhase {
    Idle,
    AwaitingTerms,
    OnchainSubmitting,
    OnchainConfirming,
    Depositing,
    DepositConfirming,
    Resizing,
    ResizeConfirming,
    Active,
    RequestingClose,
    OnchainClosing,
    Closed,
    Failed {
        at: Box<LifecyclePhase>,
        reason: String,
    },
}

impl LifecyclePhase {
    pub fn is_failed(&self) -> bool {
        matches!(self, LifecyclePhase::Failed { .. })
    }

    /// True while a multi-step operation is between its first and last step.
    pub fn is_in_flight(&self) -> bool {
        !matches!(
            self,
            LifecyclePhase::Idle
                | LifecyclePhase::Active
                | LifecyclePhase::Closed
                | LifecyclePhase::Failed { .. }
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::Idle => write!(f, "idle"),
            LifecyclePhase::AwaitingTerms => write!(f, "requesting channel terms"),
            LifecyclePhase::OnchainSubmitting => write!(f, "submitting channel on-chain"),
            LifecyclePhase::OnchainConfirming => write!(f, "waiting for channel confirmation"),
            LifecyclePhase::Depositing => write!(f, "depositing to custody"),
            LifecyclePhase::DepositConfirming => write!(f, "waiting for deposit confirmation"),
            LifecyclePhase::Resizing => write!(f, "resizing channel"),
            LifecyclePhase::ResizeConfirming => write!(f, "waiting for resize confirmation"),
            LifecyclePhase::Active => write!(f, "active"),
            LifecyclePhase::RequestingClose => write!(f, "requesting final state"),
            LifecyclePhase::OnchainClosing => write!(f, "closing channel on-chain"),
            LifecyclePhase::Closed => write!(f, "closed"),
            LifecyclePhase::Failed { at, reason } => write!(f, "failed while {}: {}", at, reason),
        }
    }
}
