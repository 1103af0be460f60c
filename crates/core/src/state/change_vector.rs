use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeVectorError {
    #[error("Malformed change vector entry '{0}': expected TAG:ETAG-DBID")]
    MalformedEntry(String),

    #[error("Invalid etag in change vector entry '{0}'")]
    InvalidEtag(String),
}

/// One node's position inside a change vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeVectorEntry {
    pub node_tag: String,
    pub etag: u64,
    pub database_id: String,
}

/// How a remote vector relates to a local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStatus {
    /// The remote vector carries changes the local one has not seen.
    Update,
    /// Both sides carry changes the other has not seen.
    Conflict,
    /// Everything in the remote vector is already reflected locally.
    AlreadyMerged,
}

/// Per-database version vector in `TAG:ETAG-DBID, ...` form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeVector {
    entries: Vec<ChangeVectorEntry>,
}

impl ChangeVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ChangeVectorEntry] {
        &self.entries
    }

    pub fn etag_for(&self, database_id: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.database_id == database_id)
            .map(|e| e.etag)
    }

    /// Parse, treating a malformed vector as empty.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }

    /// Fold `other` in, keeping the highest etag per database id.
    pub fn merge(&mut self, other: &ChangeVector) {
        for entry in &other.entries {
            match self
                .entries
                .iter_mut()
                .find(|e| e.database_id == entry.database_id)
            {
                Some(existing) if existing.etag < entry.etag => {
                    existing.etag = entry.etag;
                    existing.node_tag = entry.node_tag.clone();
                }
                Some(_) => {}
                None => self.entries.push(entry.clone()),
            }
        }
    }

    pub fn merged(mut self, other: &ChangeVector) -> Self {
        self.merge(other);
        self
    }

    pub fn conflict_status(remote: &ChangeVector, local: &ChangeVector) -> ConflictStatus {
        let remote_ahead = remote
            .entries
            .iter()
            .any(|r| local.etag_for(&r.database_id).map_or(true, |l| r.etag > l));
        let local_ahead = local
            .entries
            .iter()
            .any(|l| remote.etag_for(&l.database_id).map_or(true, |r| l.etag > r));

        match (remote_ahead, local_ahead) {
            (true, true) => ConflictStatus::Conflict,
            (true, false) => ConflictStatus::Update,
            (false, _) => ConflictStatus::AlreadyMerged,
        }
    }
}

impl FromStr for ChangeVector {
    type Err = ChangeVectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut vector = ChangeVector::new();
        for raw in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let (node_tag, rest) = raw
                .split_once(':')
                .ok_or_else(|| ChangeVectorError::MalformedEntry(raw.to_string()))?;
            let (etag, database_id) = rest
                .split_once('-')
                .ok_or_else(|| ChangeVectorError::MalformedEntry(raw.to_string()))?;
            if node_tag.is_empty() || database_id.is_empty() {
                return Err(ChangeVectorError::MalformedEntry(raw.to_string()));
            }
            let etag = etag
                .parse::<u64>()
                .map_err(|_| ChangeVectorError::InvalidEtag(raw.to_string()))?;

            vector.merge(&ChangeVector {
                entries: vec![ChangeVectorEntry {
                    node_tag: node_tag.to_string(),
                    etag,
                    database_id: database_id.to_string(),
                }],
            });
        }
        Ok(vector)
    }
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}-{}", entry.node_tag, entry.etag, entry.database_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cv(s: &str) -> ChangeVector {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let vector = cv("A:10-dbA, B:4-dbB");
        assert_eq!(vector.entries().len(), 2);
        assert_eq!(vector.etag_for("dbB"), Some(4));
        assert_eq!(vector.to_string(), "A:10-dbA, B:4-dbB");
        assert!(cv("").is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            "A10-dbA".parse::<ChangeVector>(),
            Err(ChangeVectorError::MalformedEntry(_))
        ));
        assert!(matches!(
            "A:ten-dbA".parse::<ChangeVector>(),
            Err(ChangeVectorError::InvalidEtag(_))
        ));
        assert!(ChangeVector::parse_lenient("A:ten-dbA").is_empty());
    }

    #[test]
    fn test_merge_keeps_highest_per_database() {
        let merged = cv("A:10-dbA, B:4-dbB").merged(&cv("B:7-dbB, C:1-dbC, A:3-dbA"));
        assert_eq!(merged.etag_for("dbA"), Some(10));
        assert_eq!(merged.etag_for("dbB"), Some(7));
        assert_eq!(merged.etag_for("dbC"), Some(1));
    }

    #[test]
    fn test_conflict_status() {
        let local = cv("A:10-dbA, B:4-dbB");
        assert_eq!(
            ChangeVector::conflict_status(&cv("A:8-dbA"), &local),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            ChangeVector::conflict_status(&cv("A:10-dbA, B:4-dbB"), &local),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            ChangeVector::conflict_status(&cv("A:11-dbA, B:4-dbB"), &local),
            ConflictStatus::Update
        );
        assert_eq!(
            ChangeVector::conflict_status(&cv("A:11-dbA"), &local),
            ConflictStatus::Conflict
        );
        assert_eq!(
            ChangeVector::conflict_status(&cv("C:1-dbC"), &local),
            ConflictStatus::Conflict
        );
    }
}
