//! Outcome of a reconciliation step.
//!
//! Every step of the pipeline returns a [`WorkflowStatus`]. Statuses are folded
//! with [`WorkflowStatus::merge`], and the folded status decides the persisted
//! phase and whether the resource is requeued.
//!
//! ```text
//! Ok < Incomplete < Reconciling < Pending < Failed < Invalid
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::types::Phase;

/// Message shown while a transition needs more than one pass.
pub const MULTI_STAGE_MESSAGE: &str = "performing multi stage reconciliation";

/// Variant of a [`WorkflowStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusKind {
    /// The step completed.
    Ok,
    /// The step completed but another pass is required.
    Incomplete {
        /// What is left to do.
        reason: String,
    },
    /// A reconciliation has started.
    Reconciling,
    /// Waiting on something outside the engine.
    Pending {
        /// What is being waited on.
        message: String,
        /// Overrides the default requeue delay.
        retry_after: Option<Duration>,
    },
    /// The step failed and should be retried.
    Failed {
        /// Failure description.
        message: String,
        /// Overrides the default requeue delay.
        retry_after: Option<Duration>,
    },
    /// The declared spec cannot be applied until the user edits it.
    Invalid {
        /// Validation failure.
        message: String,
        /// Phase to persist instead of `Failed`.
        target_phase: Option<Phase>,
    },
}

impl StatusKind {
    const fn rank(&self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Incomplete { .. } => 1,
            Self::Reconciling => 2,
            Self::Pending { .. } => 3,
            Self::Failed { .. } => 4,
            Self::Invalid { .. } => 5,
        }
    }
}

/// What the work queue should do with the resource after a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the resource changes.
    Done,
    /// Reconcile again after the delay.
    RequeueAfter(Duration),
}

/// Outcome of one reconciliation step, plus warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStatus {
    kind: StatusKind,
    warnings: Vec<String>,
}

impl WorkflowStatus {
    fn from_kind(kind: StatusKind) -> Self {
        Self {
            kind,
            warnings: Vec::new(),
        }
    }

    /// The step completed.
    #[must_use]
    pub fn ok() -> Self {
        Self::from_kind(StatusKind::Ok)
    }

    /// The step completed, but another reconciliation pass is needed.
    #[must_use]
    pub fn incomplete(reason: impl Into<String>) -> Self {
        Self::from_kind(StatusKind::Incomplete {
            reason: reason.into(),
        })
    }

    /// A reconciliation has started.
    #[must_use]
    pub fn reconciling() -> Self {
        Self::from_kind(StatusKind::Reconciling)
    }

    /// Waiting on something outside the engine.
    #[must_use]
    pub fn pending(message: impl Into<String>) -> Self {
        Self::from_kind(StatusKind::Pending {
            message: message.into(),
            retry_after: None,
        })
    }

    /// Waiting on something outside the engine; checked again after `retry_after`.
    #[must_use]
    pub fn pending_with_retry(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::from_kind(StatusKind::Pending {
            message: message.into(),
            retry_after: Some(retry_after),
        })
    }

    /// Failed; retried after the default delay.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::from_kind(StatusKind::Failed {
            message: message.into(),
            retry_after: None,
        })
    }

    /// Failed; retried after `retry_after`.
    #[must_use]
    pub fn failed_with_retry(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::from_kind(StatusKind::Failed {
            message: message.into(),
            retry_after: Some(retry_after),
        })
    }

    /// The declared spec is invalid; not retried.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::from_kind(StatusKind::Invalid {
            message: message.into(),
            target_phase: None,
        })
    }

    /// The declared spec is invalid and the resource should be left in `phase`.
    #[must_use]
    pub fn invalid_with_phase(message: impl Into<String>, phase: Phase) -> Self {
        Self::from_kind(StatusKind::Invalid {
            message: message.into(),
            target_phase: Some(phase),
        })
    }

    /// Attach a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.push_warning(warning.into());
        self
    }

    /// Attach several warnings.
    #[must_use]
    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        for w in warnings {
            self.push_warning(w);
        }
        self
    }

    fn push_warning(&mut self, warning: String) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    /// The status variant.
    #[must_use]
    pub const fn kind(&self) -> &StatusKind {
        &self.kind
    }

    /// Warnings collected so far.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// True only for a plain success.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.kind, StatusKind::Ok)
    }

    /// Whether later side-effecting steps may still run.
    #[must_use]
    pub const fn allows_continuation(&self) -> bool {
        matches!(
            self.kind,
            StatusKind::Ok | StatusKind::Incomplete { .. } | StatusKind::Reconciling
        )
    }

    /// Combine two statuses; the more severe one wins.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let mut warnings = self.warnings;
        for w in other.warnings {
            if !warnings.contains(&w) {
                warnings.push(w);
            }
        }

        let kind = match (self.kind, other.kind) {
            (StatusKind::Incomplete { reason: a }, StatusKind::Incomplete { reason: b }) => {
                StatusKind::Incomplete {
                    reason: join_messages(&a, &b),
                }
            }
            (
                StatusKind::Pending {
                    message: a,
                    retry_after: ra,
                },
                StatusKind::Pending {
                    message: b,
                    retry_after: rb,
                },
            ) => StatusKind::Pending {
                message: join_messages(&a, &b),
                retry_after: shortest(ra, rb),
            },
            (
                StatusKind::Failed {
                    message: a,
                    retry_after: ra,
                },
                StatusKind::Failed {
                    message: b,
                    retry_after: rb,
                },
            ) => StatusKind::Failed {
                message: join_messages(&a, &b),
                retry_after: ra.max(rb),
            },
            (
                StatusKind::Invalid {
                    message: a,
                    target_phase: pa,
                },
                StatusKind::Invalid {
                    message: b,
                    target_phase: pb,
                },
            ) => StatusKind::Invalid {
                message: join_messages(&a, &b),
                target_phase: pb.or(pa),
            },
            (a, b) => {
                if b.rank() > a.rank() {
                    b
                } else {
                    a
                }
            }
        };

        Self { kind, warnings }
    }

    /// Prefix the message of a non-successful status with `prefix`.
    #[must_use]
    pub fn on_error_prepend(mut self, prefix: &str) -> Self {
        match &mut self.kind {
            StatusKind::Pending { message, .. }
            | StatusKind::Failed { message, .. }
            | StatusKind::Invalid { message, .. } => {
                *message = format!("{prefix} {message}");
            }
            StatusKind::Ok | StatusKind::Incomplete { .. } | StatusKind::Reconciling => {}
        }
        self
    }

    /// Decide whether and when to requeue.
    #[must_use]
    pub fn reconcile_outcome(&self, default_delay: Duration) -> ReconcileOutcome {
        match &self.kind {
            StatusKind::Ok | StatusKind::Reconciling | StatusKind::Invalid { .. } => {
                ReconcileOutcome::Done
            }
            StatusKind::Incomplete { .. } => ReconcileOutcome::RequeueAfter(default_delay),
            StatusKind::Pending { retry_after, .. } | StatusKind::Failed { retry_after, .. } => {
                ReconcileOutcome::RequeueAfter(retry_after.unwrap_or(default_delay))
            }
        }
    }

    /// Phase persisted for this status.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match &self.kind {
            StatusKind::Ok => Phase::Running,
            StatusKind::Incomplete { .. } | StatusKind::Pending { .. } => Phase::Pending,
            StatusKind::Reconciling => Phase::Reconciling,
            StatusKind::Failed { .. } => Phase::Failed,
            StatusKind::Invalid { target_phase, .. } => target_phase.unwrap_or(Phase::Failed),
        }
    }

    /// Message persisted for this status, if any.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        match &self.kind {
            StatusKind::Ok | StatusKind::Reconciling => None,
            StatusKind::Incomplete { reason } if reason.is_empty() => {
                Some(MULTI_STAGE_MESSAGE.to_owned())
            }
            StatusKind::Incomplete { reason } => Some(format!("{MULTI_STAGE_MESSAGE}: {reason}")),
            StatusKind::Pending { message, .. }
            | StatusKind::Failed { message, .. }
            | StatusKind::Invalid { message, .. } => Some(message.clone()),
        }
    }

    /// Log the status at a level matching its severity.
    pub fn log(&self) {
        match &self.kind {
            StatusKind::Ok => debug!("reconciliation step succeeded"),
            StatusKind::Reconciling => debug!("reconciliation started"),
            StatusKind::Incomplete { reason } => info!(reason = %reason, "{MULTI_STAGE_MESSAGE}"),
            StatusKind::Pending { message, .. } => info!(message = %message, "reconciliation pending"),
            StatusKind::Failed { message, .. } => warn!(message = %message, "reconciliation failed"),
            StatusKind::Invalid { message, .. } => warn!(message = %message, "spec is invalid"),
        }
    }
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        Self::ok()
    }
}

fn join_messages(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_owned(),
        (_, true) => a.to_owned(),
        _ => format!("{a}; {b}"),
    }
}

fn shortest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// A boxed reconciliation step.
pub type Step<'a> = Pin<Box<dyn Future<Output = WorkflowStatus> + Send + 'a>>;

/// Run `steps` in order, or in reverse when `in_order` is false.
///
/// Stops at the first status that does not allow continuation. Incomplete
/// results of earlier steps are kept in the returned status.
pub async fn run_in_given_order(in_order: bool, steps: Vec<Step<'_>>) -> WorkflowStatus {
    let mut steps = steps;
    if !in_order {
        steps.reverse();
    }
    let mut folded = WorkflowStatus::ok();
    for step in steps {
        let status = step.await;
        folded = folded.merge(status);
        if !folded.allows_continuation() {
            break;
        }
    }
    folded
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    const DELAY: Duration = Duration::from_secs(10);

    #[test]
    fn ok_yields_to_anything() {
        assert_eq!(
            WorkflowStatus::ok().merge(WorkflowStatus::pending("wait")),
            WorkflowStatus::pending("wait")
        );
        assert_eq!(
            WorkflowStatus::failed("x").merge(WorkflowStatus::ok()),
            WorkflowStatus::failed("x")
        );
        assert!(WorkflowStatus::ok().merge(WorkflowStatus::ok()).is_ok());
    }

    #[test]
    fn pending_messages_concatenate() {
        let merged = WorkflowStatus::pending("certs").merge(WorkflowStatus::pending("agents"));
        assert_eq!(merged.message().unwrap(), "certs; agents");
        assert_eq!(merged.phase(), Phase::Pending);
    }

    #[test]
    fn failed_and_invalid_dominate_pending() {
        let merged = WorkflowStatus::pending("wait").merge(WorkflowStatus::failed("boom"));
        assert_eq!(merged, WorkflowStatus::failed("boom"));

        let merged = WorkflowStatus::invalid("bad").merge(WorkflowStatus::pending("wait"));
        assert_eq!(merged, WorkflowStatus::invalid("bad"));
    }

    #[test]
    fn invalid_dominates_failed() {
        let merged = WorkflowStatus::failed("boom").merge(WorkflowStatus::invalid("bad"));
        assert_eq!(merged.phase(), Phase::Failed);
        assert_eq!(merged.reconcile_outcome(DELAY), ReconcileOutcome::Done);
        assert_eq!(merged.message().unwrap(), "bad");
    }

    #[test]
    fn invalid_keeps_last_target_phase() {
        let merged = WorkflowStatus::invalid_with_phase("a", Phase::Pending)
            .merge(WorkflowStatus::invalid("b"));
        assert_eq!(merged.phase(), Phase::Pending);
        assert_eq!(merged.message().unwrap(), "a; b");

        let merged = WorkflowStatus::invalid_with_phase("a", Phase::Pending)
            .merge(WorkflowStatus::invalid_with_phase("b", Phase::Running));
        assert_eq!(merged.phase(), Phase::Running);
    }

    #[test]
    fn incomplete_is_not_success() {
        let status = WorkflowStatus::ok().merge(WorkflowStatus::incomplete("tls first"));
        assert!(!status.is_ok());
        assert!(status.allows_continuation());
        assert_eq!(status.phase(), Phase::Pending);
        assert_eq!(
            status.message().unwrap(),
            "performing multi stage reconciliation: tls first"
        );
        assert_eq!(
            status.reconcile_outcome(DELAY),
            ReconcileOutcome::RequeueAfter(DELAY)
        );

        let pending = status.merge(WorkflowStatus::pending("certs"));
        assert_eq!(pending, WorkflowStatus::pending("certs"));
    }

    #[test]
    fn outcome_requeues_failures_with_override() {
        assert_eq!(
            WorkflowStatus::ok().reconcile_outcome(DELAY),
            ReconcileOutcome::Done
        );
        assert_eq!(
            WorkflowStatus::reconciling().reconcile_outcome(DELAY),
            ReconcileOutcome::Done
        );
        assert_eq!(
            WorkflowStatus::failed("x").reconcile_outcome(DELAY),
            ReconcileOutcome::RequeueAfter(DELAY)
        );
        let retry = Duration::from_secs(3);
        assert_eq!(
            WorkflowStatus::failed_with_retry("x", retry).reconcile_outcome(DELAY),
            ReconcileOutcome::RequeueAfter(retry)
        );
        let merged = WorkflowStatus::pending("certs")
            .merge(WorkflowStatus::pending_with_retry("pods", retry));
        assert_eq!(
            merged.reconcile_outcome(DELAY),
            ReconcileOutcome::RequeueAfter(retry)
        );
    }

    #[test]
    fn on_error_prepend_skips_success() {
        assert!(WorkflowStatus::ok().on_error_prepend("prefix:").is_ok());
        let status = WorkflowStatus::failed("boom").on_error_prepend("publish:");
        assert_eq!(status.message().unwrap(), "publish: boom");
    }

    #[test]
    fn warnings_survive_merge_without_duplicates() {
        let a = WorkflowStatus::ok().with_warning("w1");
        let b = WorkflowStatus::pending("p").with_warnings(vec!["w1".to_owned(), "w2".to_owned()]);
        let merged = a.merge(b);
        assert_eq!(merged.warnings(), ["w1".to_owned(), "w2".to_owned()]);
    }

    #[tokio::test]
    async fn run_in_given_order_reverses_and_stops() {
        let calls = Arc::new(Mutex::new(Vec::new()));

        let step = |name: &'static str, status: WorkflowStatus| -> Step<'static> {
            let calls = calls.clone();
            Box::pin(async move {
                calls.lock().unwrap().push(name);
                status
            })
        };

        let steps = vec![
            step("first", WorkflowStatus::ok()),
            step("second", WorkflowStatus::failed("stop")),
        ];
        let status = run_in_given_order(false, steps).await;

        assert_eq!(status, WorkflowStatus::failed("stop"));
        assert_eq!(*calls.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn run_in_given_order_keeps_incomplete() {
        let mut steps: Vec<Step<'_>> = Vec::new();
        steps.push(Box::pin(async { WorkflowStatus::incomplete("x509 later") }));
        steps.push(Box::pin(async { WorkflowStatus::ok() }));

        let status = run_in_given_order(true, steps).await;
        assert_eq!(status, WorkflowStatus::incomplete("x509 later"));
    }
}
