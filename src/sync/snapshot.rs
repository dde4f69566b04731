use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RosterError;
use crate::roster::Roster;

/// Serialized form of the roster shared through the cache and persisted on
/// checkpoint. `version` grows by one with every coordinator write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    pub roster: Roster,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u64,
}

impl RosterSnapshot {
    pub fn initial(roster: Roster) -> Self {
        Self::with_version(1, roster)
    }

    pub fn with_version(version: u64, roster: Roster) -> Self {
        Self {
            version,
            saved_at: Utc::now(),
            roster,
        }
    }

    pub fn next(&self, roster: Roster) -> Self {
        Self::with_version(self.version.saturating_add(1), roster)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RosterError> {
        serde_json::to_vec(self).map_err(|err| RosterError::CorruptSnapshot(err.to_string()))
    }

    /// Decodes and checks the roster invariants.
    pub fn decode(bytes: &[u8]) -> Result<Self, RosterError> {
        let snapshot: Self = serde_json::from_slice(bytes)
            .map_err(|err| RosterError::CorruptSnapshot(err.to_string()))?;
        snapshot.roster.validate()?;
        Ok(snapshot)
    }

    /// Reads only the version field.
    pub fn peek_version(bytes: &[u8]) -> Option<u64> {
        serde_json::from_slice::<VersionHeader>(bytes)
            .ok()
            .map(|header| header.version)
    }
}
