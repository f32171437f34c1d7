// src/consolidate/record.rs
// The consolidated document: one canonical JSON record per repair session.
// Its serialized shape is the compatibility contract with every other
// consumer of the mirror, so field names stay camelCase and `updatedAt` is
// ISO-8601.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::AttachmentRef;
use crate::session::SessionId;

/// Workflow phases in their intended forward order. Phase data may still
/// arrive in any order; this ordering is used for display and backfill
/// replay only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairPhase {
    Started,
    Diagnosed,
    Confirmed,
    GuideGenerated,
}

impl RepairPhase {
    pub const ALL: [RepairPhase; 4] = [
        Self::Started,
        Self::Diagnosed,
        Self::Confirmed,
        Self::GuideGenerated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::Diagnosed => "Diagnosed",
            Self::Confirmed => "Confirmed",
            Self::GuideGenerated => "GuideGenerated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Started" => Some(Self::Started),
            "Diagnosed" => Some(Self::Diagnosed),
            "Confirmed" => Some(Self::Confirmed),
            "GuideGenerated" => Some(Self::GuideGenerated),
            _ => None,
        }
    }
}

/// Sort rank for replaying phase history: known phases in workflow order,
/// anything else after them in input order.
pub fn phase_sort_rank(name: &str) -> usize {
    RepairPhase::from_str(name)
        .map(|p| RepairPhase::ALL.iter().position(|q| *q == p).unwrap_or(0))
        .unwrap_or(RepairPhase::ALL.len())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub revision: u64,
    /// Phase name → latest payload for that phase (shallow replace on merge).
    pub phases: BTreeMap<String, serde_json::Value>,
    pub attachments: Vec<AttachmentRef>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// A never-committed record at revision 0. The first commit bumps it
    /// to revision 1.
    pub fn fresh(session_id: SessionId) -> Self {
        Self {
            session_id,
            revision: 0,
            phases: BTreeMap::new(),
            attachments: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Merge a phase payload by key. Ordering is irrelevant: a late
    /// "Diagnosed" upload after "Confirmed" still lands in its own slot.
    pub fn merge_phase(&mut self, phase: &str, data: serde_json::Value) {
        self.phases.insert(phase.to_string(), data);
    }

    /// Append an attachment ref unless the `(contentHash, purpose)` pair is
    /// already present. Returns whether the record changed.
    pub fn merge_attachment(&mut self, att: AttachmentRef) -> bool {
        let already_present = self
            .attachments
            .iter()
            .any(|a| a.content_hash == att.content_hash && a.purpose == att.purpose);
        if already_present {
            return false;
        }
        self.attachments.push(att);
        true
    }
}

/// Prefix shared by every consolidated-document key.
pub const SESSION_PREFIX: &str = "sess/";

/// Append-only, revision-stamped storage key. Zero-padded so a prefix
/// listing returns revisions in commit order.
pub fn revision_key(session_id: SessionId, revision: u64) -> String {
    format!("{SESSION_PREFIX}{session_id}/r{revision:06}")
}
