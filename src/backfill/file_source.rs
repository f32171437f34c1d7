// src/backfill/file_source.rs
// History source backed by a JSON export of the primary store, so the
// backfill CLI can run without a live workflow database.
//
// Export shape:
// {
//   "sessions": [
//     {
//       "sessionId": 501,
//       "phases": [{"phase": "Started", "data": {"deviceType": "Laptop"}}],
//       "attachments": [
//         {"purpose": "diagnostic_audio", "contentType": "audio/wav",
//          "bytesBase64": "..."}
//       ]
//     }
//   ]
// }

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use base64::prelude::*;
use serde::Deserialize;

use crate::session::SessionId;

use super::{HistoricalAttachment, HistoricalPhase, PhaseHistorySource};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportFile {
    sessions: Vec<ExportSession>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportSession {
    session_id: SessionId,
    #[serde(default)]
    phases: Vec<ExportPhase>,
    #[serde(default)]
    attachments: Vec<ExportAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportPhase {
    phase: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportAttachment {
    purpose: String,
    content_type: String,
    bytes_base64: String,
}

struct SessionHistory {
    phases: Vec<HistoricalPhase>,
    attachments: Vec<HistoricalAttachment>,
}

pub struct JsonHistorySource {
    sessions: HashMap<SessionId, SessionHistory>,
}

impl JsonHistorySource {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading export file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let export: ExportFile = serde_json::from_str(raw).context("parsing export JSON")?;

        let mut sessions = HashMap::new();
        for session in export.sessions {
            let attachments = session
                .attachments
                .into_iter()
                .map(|att| {
                    let bytes = BASE64_STANDARD.decode(&att.bytes_base64).with_context(|| {
                        format!(
                            "decoding attachment bytes for session {} purpose {}",
                            session.session_id, att.purpose
                        )
                    })?;
                    Ok(HistoricalAttachment {
                        purpose: att.purpose,
                        content_type: att.content_type,
                        bytes,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let phases = session
                .phases
                .into_iter()
                .map(|p| HistoricalPhase {
                    phase: p.phase,
                    data: p.data,
                })
                .collect();

            sessions.insert(
                session.session_id,
                SessionHistory {
                    phases,
                    attachments,
                },
            );
        }

        Ok(Self { sessions })
    }
}

#[async_trait]
impl PhaseHistorySource for JsonHistorySource {
    async fn session_ids(&self) -> anyhow::Result<Vec<SessionId>> {
        Ok(self.sessions.keys().copied().collect())
    }

    async fn phases(&self, session_id: SessionId) -> anyhow::Result<Vec<HistoricalPhase>> {
        Ok(self
            .sessions
            .get(&session_id)
            .map(|s| s.phases.clone())
            .unwrap_or_default())
    }

    async fn attachments(
        &self,
        session_id: SessionId,
    ) -> anyhow::Result<Vec<HistoricalAttachment>> {
        Ok(self
            .sessions
            .get(&session_id)
            .map(|s| s.attachments.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"{
        "sessions": [
            {
                "sessionId": 501,
                "phases": [
                    {"phase": "Diagnosed", "data": {"cause": "battery"}},
                    {"phase": "Started", "data": {"deviceType": "Laptop"}}
                ],
                "attachments": [
                    {"purpose": "diagnostic_audio", "contentType": "audio/wav",
                     "bytesBase64": "UklGRg=="}
                ]
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_parses_export_and_decodes_bytes() {
        let source = JsonHistorySource::from_json(EXPORT).unwrap();

        assert_eq!(source.session_ids().await.unwrap(), vec![501]);
        let phases = source.phases(501).await.unwrap();
        assert_eq!(phases.len(), 2);

        let attachments = source.attachments(501).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].bytes, b"RIFF");
    }

    #[test]
    fn test_rejects_bad_base64() {
        let bad = EXPORT.replace("UklGRg==", "not base64!!!");
        assert!(JsonHistorySource::from_json(&bad).is_err());
    }

    #[tokio::test]
    async fn test_unknown_session_is_empty_history() {
        let source = JsonHistorySource::from_json(EXPORT).unwrap();
        assert!(source.phases(999).await.unwrap().is_empty());
        assert!(source.attachments(999).await.unwrap().is_empty());
    }
}
