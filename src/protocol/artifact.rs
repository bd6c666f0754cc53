//! Reproducibility artifact: the exact protocol a session ran, as JSON.
//!
//! The document carries every segment plus the parameters and gas line they
//! were generated from. A SHA-256 fingerprint of the segment list guards
//! against hand edits; [`load_protocol`] rejects an artifact whose fingerprint,
//! format version or total duration does not match its contents.

use super::{Protocol, ProtocolMetadata, SetpointSegment};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Current artifact layout version.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// On-disk form of a [`Protocol`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolArtifact {
    /// Layout version; must equal [`ARTIFACT_FORMAT_VERSION`].
    pub format_version: u32,
    /// Session that wrote the artifact, if any.
    pub session_id: Option<Uuid>,
    /// Host the session ran on.
    pub host: Option<String>,
    /// Parameters, gas line and generation time.
    #[serde(flatten)]
    pub metadata: ProtocolMetadata,
    /// Hex SHA-256 of the serialized segment list.
    pub fingerprint: String,
    /// End of the last segment.
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    /// Every segment, in protocol order.
    pub segments: Vec<SetpointSegment>,
}

impl ProtocolArtifact {
    /// Snapshot `protocol` for persistence.
    pub fn from_protocol(protocol: &Protocol, session_id: Option<Uuid>) -> AppResult<Self> {
        Ok(Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            session_id,
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok()),
            metadata: protocol.metadata().clone(),
            fingerprint: fingerprint(protocol.segments())?,
            total_duration: protocol.total_duration(),
            segments: protocol.segments().to_vec(),
        })
    }

    /// Check the artifact and rebuild the protocol it describes.
    pub fn into_protocol(self) -> AppResult<Protocol> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(DaqError::Configuration(format!(
                "unsupported protocol artifact version {} (expected {})",
                self.format_version, ARTIFACT_FORMAT_VERSION
            )));
        }
        let actual = fingerprint(&self.segments)?;
        if actual != self.fingerprint {
            return Err(DaqError::Configuration(format!(
                "protocol artifact fingerprint mismatch: recorded {}, computed {}",
                self.fingerprint, actual
            )));
        }

        let protocol = Protocol::new(self.segments, self.metadata)?;
        if protocol.total_duration() != self.total_duration {
            return Err(DaqError::Configuration(format!(
                "protocol artifact total duration {:?} does not match its segments ({:?})",
                self.total_duration,
                protocol.total_duration()
            )));
        }
        Ok(protocol)
    }
}

/// Hex SHA-256 over the JSON encoding of `segments`.
pub fn fingerprint(segments: &[SetpointSegment]) -> AppResult<String> {
    let bytes = serde_json::to_vec(segments)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Write `protocol` to a new file at `path` as pretty JSON, creating parent directories.
///
/// Fails if `path` already exists.
pub fn persist_protocol(
    protocol: &Protocol,
    path: &Path,
    session_id: Option<Uuid>,
) -> AppResult<()> {
    let artifact = ProtocolArtifact::from_protocol(protocol, session_id)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&artifact)?;
    // An existing artifact is never replaced.
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(json.as_bytes())?;
    info!(
        path = %path.display(),
        segments = artifact.segments.len(),
        fingerprint = %artifact.fingerprint,
        "protocol artifact written"
    );
    Ok(())
}

/// Load and verify a protocol artifact.
pub fn load_protocol(path: &Path) -> AppResult<Protocol> {
    let json = fs::read_to_string(path)?;
    let artifact: ProtocolArtifact = serde_json::from_str(&json)?;
    debug!(path = %path.display(), session_id = ?artifact.session_id, "loaded protocol artifact");
    artifact.into_protocol()
}
