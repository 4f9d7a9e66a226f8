//! State machines for deployments and nodes.
//!
//! Deployment states are encoded in the type system, making invalid
//! transitions a compile-time error. Node states are driven step by step
//! by the installer pipeline, so they are checked at runtime against an
//! explicit transition table instead.
//!
//! # Example
//!
//! ```ignore
//! let pending = Deployment::<Pending>::create(data);
//! let running = pending.start();
//! let completed = running.complete(result);
//! // completed.start() would not compile - invalid transition
//! ```

use std::marker::PhantomData;

use chrono::Utc;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    DeploymentData, DeploymentId, DeploymentRecord, DeploymentResult, DeploymentStatus,
    InstallStepKind, NodeStatus, StepKind,
};

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted status representation.
    fn status() -> DeploymentStatus;
}

mod private {
    pub trait Sealed {}
}

/// Deployment accepted, pipelines not started.
#[derive(Debug, Clone, Copy)]
pub struct Pending;

/// Pipelines are running.
#[derive(Debug, Clone, Copy)]
pub struct Running;

/// Every node succeeded.
#[derive(Debug, Clone, Copy)]
pub struct Completed;

/// At least one node failed.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

/// Cancelled by a user.
#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

/// The overall ceiling expired.
#[derive(Debug, Clone, Copy)]
pub struct TimedOut;

macro_rules! deployment_state {
    ($($state:ident => $status:ident),+ $(,)?) => {
        $(
            impl private::Sealed for $state {}

            impl DeploymentState for $state {
                fn status() -> DeploymentStatus {
                    DeploymentStatus::$status
                }
            }
        )+
    };
}

deployment_state!(
    Pending => Pending,
    Running => Running,
    Completed => Completed,
    Failed => Failed,
    Cancelled => Cancelled,
    TimedOut => TimedOut,
);

// =============================================================================
// Deployment struct parameterised by state
// =============================================================================

/// A deployment in a specific state.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    data: DeploymentData,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::status()
    }

    /// A storable copy of the current state.
    #[must_use]
    pub fn to_record(&self) -> DeploymentRecord {
        DeploymentRecord {
            data: self.data.clone(),
            status: S::status(),
        }
    }

    /// Convert into a storable record.
    #[must_use]
    pub fn into_record(self) -> DeploymentRecord {
        DeploymentRecord {
            data: self.data,
            status: S::status(),
        }
    }

    fn transition_with<T: DeploymentState>(
        mut self,
        f: impl FnOnce(&mut DeploymentData),
    ) -> Deployment<T> {
        f(&mut self.data);
        self.data.updated_at = Utc::now();
        Deployment {
            data: self.data,
            _state: PhantomData,
        }
    }

    fn finish<T: DeploymentState>(
        self,
        result: DeploymentResult,
        error: Option<String>,
    ) -> Deployment<T> {
        self.transition_with(|data| {
            let now = Utc::now();
            data.result = Some(result);
            data.error = error;
            data.current_step = None;
            data.completed_at = Some(now);
        })
    }
}

// =============================================================================
// State transitions
// =============================================================================

impl Deployment<Pending> {
    /// Create a new deployment in the pending state.
    #[must_use]
    pub const fn create(data: DeploymentData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// Start running pipelines.
    #[must_use]
    pub fn start(self) -> Deployment<Running> {
        self.transition_with(|data| data.started_at = Some(Utc::now()))
    }

    /// Cancel before any pipeline started.
    #[must_use]
    pub fn cancel(self, result: DeploymentResult) -> Deployment<Cancelled> {
        self.finish(result, Some("cancelled before start".to_owned()))
    }

    /// Fail before any pipeline started.
    #[must_use]
    pub fn fail(self, error: String) -> Deployment<Failed> {
        self.transition_with(|data| {
            data.error = Some(error);
            data.completed_at = Some(Utc::now());
        })
    }
}

impl Deployment<Running> {
    /// Record aggregated progress. Progress never decreases.
    ///
    /// Returns whether anything changed.
    pub fn record_progress(
        &mut self,
        progress: u8,
        current_step: Option<StepKind>,
        result: DeploymentResult,
    ) -> bool {
        let progress = progress.max(self.data.progress).min(100);
        let changed = progress != self.data.progress
            || current_step != self.data.current_step
            || self.data.result.as_ref() != Some(&result);
        if changed {
            self.data.progress = progress;
            self.data.current_step = current_step;
            self.data.result = Some(result);
            self.data.updated_at = Utc::now();
        }
        changed
    }

    /// Every node succeeded.
    #[must_use]
    pub fn complete(self, result: DeploymentResult) -> Deployment<Completed> {
        self.transition_with(|data| {
            data.progress = 100;
            data.result = Some(result);
            data.error = None;
            data.current_step = None;
            data.completed_at = Some(Utc::now());
        })
    }

    /// At least one node failed.
    #[must_use]
    pub fn fail(self, result: DeploymentResult, error: String) -> Deployment<Failed> {
        self.finish(result, Some(error))
    }

    /// Cancelled while running.
    #[must_use]
    pub fn cancel(self, result: DeploymentResult) -> Deployment<Cancelled> {
        self.finish(result, Some("cancelled".to_owned()))
    }

    /// The overall ceiling expired.
    #[must_use]
    pub fn time_out(self, result: DeploymentResult, limit_secs: u64) -> Deployment<TimedOut> {
        let error = ControlError::Timeout(limit_secs).to_string();
        self.finish(result, Some(error))
    }
}

// =============================================================================
// Loading from persisted state
// =============================================================================

/// A type-erased deployment that can be in any state.
///
/// Used when loading from the store where the state is not known at
/// compile time.
#[derive(Debug)]
pub enum AnyDeployment {
    /// Deployment in pending state.
    Pending(Deployment<Pending>),
    /// Deployment in running state.
    Running(Deployment<Running>),
    /// Deployment in completed state.
    Completed(Deployment<Completed>),
    /// Deployment in failed state.
    Failed(Deployment<Failed>),
    /// Deployment in cancelled state.
    Cancelled(Deployment<Cancelled>),
    /// Deployment in timed-out state.
    TimedOut(Deployment<TimedOut>),
}

impl AnyDeployment {
    /// Create an `AnyDeployment` from a stored record.
    #[must_use]
    pub fn from_record(record: DeploymentRecord) -> Self {
        let DeploymentRecord { data, status } = record;
        match status {
            DeploymentStatus::Pending => Self::Pending(Deployment::create(data)),
            DeploymentStatus::Running => Self::Running(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Completed => Self::Completed(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Failed => Self::Failed(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Cancelled => Self::Cancelled(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::TimedOut => Self::TimedOut(Deployment {
                data,
                _state: PhantomData,
            }),
        }
    }

    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        match self {
            Self::Pending(d) => d.data(),
            Self::Running(d) => d.data(),
            Self::Completed(d) => d.data(),
            Self::Failed(d) => d.data(),
            Self::Cancelled(d) => d.data(),
            Self::TimedOut(d) => d.data(),
        }
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> DeploymentStatus {
        match self {
            Self::Pending(_) => DeploymentStatus::Pending,
            Self::Running(_) => DeploymentStatus::Running,
            Self::Completed(_) => DeploymentStatus::Completed,
            Self::Failed(_) => DeploymentStatus::Failed,
            Self::Cancelled(_) => DeploymentStatus::Cancelled,
            Self::TimedOut(_) => DeploymentStatus::TimedOut,
        }
    }

    /// Try to extract a pending deployment.
    pub fn try_into_pending(self) -> ControlResult<Deployment<Pending>> {
        match self {
            Self::Pending(d) => Ok(d),
            other => Err(ControlError::InvalidStateTransition {
                from: other.status().as_str(),
                to: "pending",
            }),
        }
    }

    /// Try to extract a running deployment.
    pub fn try_into_running(self) -> ControlResult<Deployment<Running>> {
        match self {
            Self::Running(d) => Ok(d),
            other => Err(ControlError::InvalidStateTransition {
                from: other.status().as_str(),
                to: "running",
            }),
        }
    }

    /// Cancel from whichever non-terminal state the deployment is in.
    pub fn cancel(self, result: DeploymentResult) -> ControlResult<Deployment<Cancelled>> {
        match self {
            Self::Pending(d) => Ok(d.cancel(result)),
            Self::Running(d) => Ok(d.cancel(result)),
            other => Err(ControlError::InvalidStateTransition {
                from: other.status().as_str(),
                to: "cancelled",
            }),
        }
    }

    /// Check if the deployment is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

// =============================================================================
// Node transitions
// =============================================================================

impl NodeStatus {
    /// Whether the node may move from this status to `next`.
    ///
    /// Re-entering the current status is always allowed so that steps which
    /// keep the node in place (download, configure, start) are no-ops.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use NodeStatus as S;

        if *self == next {
            return true;
        }

        match (self, next) {
            (S::Pending | S::Active | S::Failed, S::Connecting) => true,
            (S::Connecting, S::Installing) => true,
            (S::Installing, S::Configuring) => true,
            (S::Configuring, S::Active) => true,
            (
                S::Pending | S::Connecting | S::Installing | S::Configuring | S::Active | S::Failed,
                S::Removing,
            ) => true,
            (
                S::Pending | S::Connecting | S::Installing | S::Configuring | S::Removing,
                S::Failed,
            ) => true,
            _ => false,
        }
    }

    /// Check a transition, returning an error if it is not in the table.
    pub fn transition_to(self, next: Self) -> ControlResult<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ControlError::InvalidStateTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// Node status while an install step runs and after it succeeds.
#[must_use]
pub const fn install_transition(step: InstallStepKind) -> (NodeStatus, NodeStatus) {
    match step {
        InstallStepKind::Connect => (NodeStatus::Connecting, NodeStatus::Installing),
        InstallStepKind::Download => (NodeStatus::Installing, NodeStatus::Installing),
        InstallStepKind::Install => (NodeStatus::Installing, NodeStatus::Configuring),
        InstallStepKind::Configure | InstallStepKind::Start => {
            (NodeStatus::Configuring, NodeStatus::Configuring)
        }
        InstallStepKind::Validate => (NodeStatus::Configuring, NodeStatus::Active),
    }
}
