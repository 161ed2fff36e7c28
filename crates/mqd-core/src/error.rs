use thiserror::Error;

/// Failures from the Workspace Driver (C4) that the Scheduler needs to
/// distinguish when deciding how to record a `MergeStatus`.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("merge conflict merging {from} into {into}: {detail}")]
    MergeConflict {
        from: String,
        into: String,
        detail: String,
    },
    #[error("push of {refspec} was rejected: {detail}")]
    PushRejected { refspec: String, detail: String },
    #[error("worktree dirty after failed commit in {dir}: {detail}")]
    DirtyWorktree { dir: String, detail: String },
    #[error("git {op} failed: {detail}")]
    Command { op: String, detail: String },
}

/// Failures from the `Store` (C2) seam.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
