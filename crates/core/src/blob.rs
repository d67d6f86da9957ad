//! Blob record types and workspace-scoped object keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default MIME type for blobs whose type is unknown.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Blob record lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobStatus {
    /// Upload initiated, bytes not yet verified.
    Pending,
    /// Bytes verified against the content-hash key.
    Completed,
}

impl BlobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for BlobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(crate::Error::InvalidBlobStatus(other.to_string())),
        }
    }
}

/// Backend object key for a blob: `{workspace_id}/{key}`.
pub fn object_key(workspace_id: &str, key: &str) -> String {
    format!("{workspace_id}/{key}")
}

/// Prefix under which every object of a workspace lives.
pub fn workspace_prefix(workspace_id: &str) -> String {
    format!("{workspace_id}/")
}

/// A backend object key split into its workspace and blob parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceKey<'a> {
    pub workspace_id: &'a str,
    pub key: &'a str,
}

impl<'a> WorkspaceKey<'a> {
    /// Parse `workspace/key`. Exactly two non-empty segments are accepted.
    pub fn parse(object_key: &'a str) -> Option<Self> {
        let mut parts = object_key.split('/');
        let workspace_id = parts.next()?;
        let key = parts.next()?;
        if parts.next().is_some() || workspace_id.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self { workspace_id, key })
    }
}
