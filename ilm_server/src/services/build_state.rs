//! Build status transitions and result aggregation, free of any store access.

use std::collections::HashSet;

use crate::models::build::{BuildResult, BuildStatusLabel};
use crate::models::target_artifact::TargetArtifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Re-applying the current status; nothing is written.
    Unchanged,
    Advance,
}

/// Whether `from -> to` is allowed. `None` means the move is rejected.
///
/// Terminal statuses only accept themselves, so a finished or stopped build
/// can never regress to `running`.
pub fn check_transition(from: BuildStatusLabel, to: BuildStatusLabel) -> Option<Transition> {
    use BuildStatusLabel::*;

    if from == to {
        return Some(Transition::Unchanged);
    }
    match (from, to) {
        (New, Running) | (New, Stopped) => Some(Transition::Advance),
        (Running, Stopped) | (Running, FinishedSuccess) | (Running, FinishedFailed) => {
            Some(Transition::Advance)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    /// Target ids still waiting for a result.
    Pending { remaining: Vec<String> },
    Complete(BuildStatusLabel),
}

/// Evaluate the aggregation rule: complete once every declared target has a
/// result, failed if any recorded result failed. Results for targets that
/// are not declared are ignored.
pub fn aggregate(targets: &[TargetArtifact], results: &[BuildResult]) -> Aggregate {
    let reported: HashSet<&str> = results
        .iter()
        .map(|r| r.target_artifact.id.as_str())
        .collect();
    let remaining: Vec<String> = targets
        .iter()
        .filter(|t| !reported.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect();
    if !remaining.is_empty() {
        return Aggregate::Pending { remaining };
    }

    let declared: HashSet<&str> = targets.iter().map(|t| t.id.as_str()).collect();
    let failed = results
        .iter()
        .filter(|r| declared.contains(r.target_artifact.id.as_str()))
        .any(|r| !r.successful);
    if failed {
        Aggregate::Complete(BuildStatusLabel::FinishedFailed)
    } else {
        Aggregate::Complete(BuildStatusLabel::FinishedSuccess)
    }
}
