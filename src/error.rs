//! # Error Taxonomy
//!
//! Errors flow through `eyre::Result` with context attached the usual way,
//! but a few kinds must stay distinguishable to callers:
//!
//! - **I/O errors** propagate verbatim from the file layer and abort the
//!   surrounding atomic operation.
//! - **[`ClusterError`]** wraps structural failures inside a CRUD path and
//!   carries the cluster name plus the operation that failed. Callers match
//!   it with `report.downcast_ref::<ClusterError>()`.
//! - **[`RecordNotFoundError`]** is raised only by
//!   `read_record_if_version_is_not_latest`; plain reads and deletes return
//!   `None`/`false` sentinels instead.
//! - Illegal-state failures (an append refused despite the free list
//!   claiming room) are plain `eyre` reports raised after the page has been
//!   dumped to the log; they indicate a bug, not a recoverable condition.

use std::fmt;

/// Identity of one record: owning cluster id plus its logical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub cluster_id: i32,
    pub cluster_position: i64,
}

impl RecordId {
    pub fn new(cluster_id: i32, cluster_position: i64) -> Self {
        Self {
            cluster_id,
            cluster_position,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

/// Structural failure inside a cluster CRUD path.
#[derive(Debug, thiserror::Error)]
#[error("cluster '{cluster}': {message}")]
pub struct ClusterError {
    cluster: String,
    message: String,
}

impl ClusterError {
    pub fn new(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A record addressed by id that does not exist (or is no longer present).
#[derive(Debug, thiserror::Error)]
#[error("record {record_id} is absent")]
pub struct RecordNotFoundError {
    pub record_id: RecordId,
}

impl RecordNotFoundError {
    pub fn new(record_id: RecordId) -> Self {
        Self { record_id }
    }
}
