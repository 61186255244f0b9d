// src/txn/rollback.rs

//! Undo log and best-effort rollback
//!
//! Each successfully executed operation leaves a [`CompletedOperation`]
//! holding enough to reverse it. Rollback replays the log backwards; a step
//! that cannot be reversed (rmdir, deletes whose content was never
//! captured) is logged and skipped, and a step that fails is recorded but
//! does not stop the remaining steps.

use super::storage::{RmOptions, RmdirOptions, Storage, WriteOptions};
use crate::error::Result;
use crate::page::now_millis;
use std::time::Instant;
use tracing::{debug, warn};

/// Undo record captured when an operation is applied
#[derive(Debug, Clone)]
pub enum CompletedOperation {
    Write {
        path: String,
        /// Whether the target existed before this write
        existed: bool,
        /// Previous bytes, when the port could read them
        previous_content: Option<Vec<u8>>,
        completed_at: i64,
    },
    /// unlink or non-recursive rm of a file
    Delete {
        path: String,
        previous_content: Option<Vec<u8>>,
        completed_at: i64,
    },
    /// Recursive rm; nothing restorable
    RemoveTree { path: String, completed_at: i64 },
    Rename {
        old: String,
        new: String,
        completed_at: i64,
    },
    Mkdir { path: String, completed_at: i64 },
    /// Nothing restorable
    Rmdir { path: String, completed_at: i64 },
}

impl CompletedOperation {
    pub fn write(path: impl Into<String>, existed: bool, previous_content: Option<Vec<u8>>) -> Self {
        Self::Write {
            path: path.into(),
            existed,
            previous_content,
            completed_at: now_millis(),
        }
    }

    pub fn delete(path: impl Into<String>, previous_content: Option<Vec<u8>>) -> Self {
        Self::Delete {
            path: path.into(),
            previous_content,
            completed_at: now_millis(),
        }
    }

    pub fn remove_tree(path: impl Into<String>) -> Self {
        Self::RemoveTree {
            path: path.into(),
            completed_at: now_millis(),
        }
    }

    pub fn rename(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self::Rename {
            old: old.into(),
            new: new.into(),
            completed_at: now_millis(),
        }
    }

    pub fn mkdir(path: impl Into<String>) -> Self {
        Self::Mkdir {
            path: path.into(),
            completed_at: now_millis(),
        }
    }

    pub fn rmdir(path: impl Into<String>) -> Self {
        Self::Rmdir {
            path: path.into(),
            completed_at: now_millis(),
        }
    }

    /// The operation's primary path
    pub fn path(&self) -> &str {
        match self {
            Self::Write { path, .. }
            | Self::Delete { path, .. }
            | Self::RemoveTree { path, .. }
            | Self::Mkdir { path, .. }
            | Self::Rmdir { path, .. } => path,
            Self::Rename { old, .. } => old,
        }
    }

    /// Short tag for logs and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Delete { .. } => "delete",
            Self::RemoveTree { .. } => "rm -r",
            Self::Rename { .. } => "rename",
            Self::Mkdir { .. } => "mkdir",
            Self::Rmdir { .. } => "rmdir",
        }
    }
}

/// How one rollback step went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Restored,
    /// Nothing to do, with the reason
    Skipped(String),
    Failed(String),
}

/// One entry in the rollback report
#[derive(Debug, Clone)]
pub struct RollbackStep {
    pub operation: &'static str,
    pub path: String,
    pub outcome: StepOutcome,
}

/// Per-step record of the undo pass after a failed transaction
#[derive(Debug, Clone, Default)]
pub struct RollbackSummary {
    pub steps: Vec<RollbackStep>,
    pub duration_ms: u64,
}

impl RollbackSummary {
    /// True when no step failed (skips are fine)
    pub fn succeeded(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|s| matches!(s.outcome, StepOutcome::Failed(_)))
    }

    /// Failure messages in rollback order
    pub fn errors(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter_map(|s| match &s.outcome {
                StepOutcome::Failed(e) => {
                    Some(format!("rollback of {} {}: {}", s.operation, s.path, e))
                }
                _ => None,
            })
            .collect()
    }

    pub fn restored_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Restored)
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Skipped(_)))
            .count()
    }
}

/// Replay completed operations in reverse, applying each inverse
pub(crate) async fn rollback_completed(
    storage: &dyn Storage,
    completed: &[CompletedOperation],
) -> RollbackSummary {
    let start = Instant::now();
    let mut summary = RollbackSummary::default();

    for op in completed.iter().rev() {
        let outcome = match rollback_step(storage, op).await {
            Ok(outcome) => outcome,
            Err(e) => StepOutcome::Failed(e.to_string()),
        };

        if let StepOutcome::Skipped(reason) = &outcome {
            warn!("cannot restore {} {}: {}", op.kind(), op.path(), reason);
        }

        summary.steps.push(RollbackStep {
            operation: op.kind(),
            path: op.path().to_string(),
            outcome,
        });
    }

    summary.duration_ms = start.elapsed().as_millis() as u64;
    debug!(
        "rollback: {} restored, {} skipped, {} failed",
        summary.restored_count(),
        summary.skipped_count(),
        summary.steps.len() - summary.restored_count() - summary.skipped_count()
    );
    summary
}

async fn rollback_step(storage: &dyn Storage, op: &CompletedOperation) -> Result<StepOutcome> {
    match op {
        CompletedOperation::Write {
            path,
            existed,
            previous_content,
            ..
        } => {
            if *existed {
                match previous_content {
                    Some(bytes) => {
                        storage
                            .write_file(path, bytes, &WriteOptions::default())
                            .await?;
                        Ok(StepOutcome::Restored)
                    }
                    None => Ok(StepOutcome::Skipped(
                        "previous content was not captured".to_string(),
                    )),
                }
            } else {
                delete_best_effort(storage, path).await?;
                Ok(StepOutcome::Restored)
            }
        }

        CompletedOperation::Delete {
            path,
            previous_content,
            ..
        } => match previous_content {
            Some(bytes) => {
                storage
                    .write_file(path, bytes, &WriteOptions::default())
                    .await?;
                Ok(StepOutcome::Restored)
            }
            None => Ok(StepOutcome::Skipped(
                "deleted content was not captured".to_string(),
            )),
        },

        CompletedOperation::RemoveTree { .. } => Ok(StepOutcome::Skipped(
            "recursive removal is not restorable".to_string(),
        )),

        CompletedOperation::Rename { old, new, .. } => {
            storage.rename(new, old, true).await?;
            Ok(StepOutcome::Restored)
        }

        CompletedOperation::Mkdir { path, .. } => {
            let caps = storage.caps();
            if caps.rmdir {
                storage.rmdir(path, &RmdirOptions::default()).await?;
            } else if caps.rm {
                storage
                    .rm(
                        path,
                        &RmOptions {
                            force: true,
                            recursive: true,
                        },
                    )
                    .await?;
            } else {
                return Ok(StepOutcome::Skipped(
                    "no directory removal capability".to_string(),
                ));
            }
            Ok(StepOutcome::Restored)
        }

        CompletedOperation::Rmdir { .. } => Ok(StepOutcome::Skipped(
            "removed directory is not restorable".to_string(),
        )),
    }
}

/// Delete a file via whichever capability the port has: rm, then unlink,
/// then the legacy delete
pub(crate) async fn delete_best_effort(storage: &dyn Storage, path: &str) -> Result<()> {
    let caps = storage.caps();
    if caps.rm {
        storage
            .rm(
                path,
                &RmOptions {
                    force: true,
                    recursive: false,
                },
            )
            .await
    } else if caps.unlink {
        storage.unlink(path).await
    } else if caps.delete_file {
        storage.delete_file(path).await
    } else {
        Err(crate::error::Error::Unsupported("rm"))
    }
}
