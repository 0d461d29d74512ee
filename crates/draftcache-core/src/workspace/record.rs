//! Encoding of the workspace metadata hash.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::types::{MetadataPatch, WorkspaceSnapshot};

pub const FIELD_TOKEN: &str = "token";
pub const FIELD_OWNER: &str = "owner_id";
pub const FIELD_TOPIC: &str = "topic";
pub const FIELD_LANGUAGE: &str = "language";
pub const FIELD_TARGET: &str = "generation_target";
pub const FIELD_BODY: &str = "draft_body";
pub const FIELD_ARTIFACT: &str = "artifact_id";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_LINKED_VERSION: &str = "linked_version";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_EXTRA: &str = "extra";

fn pair(field: &str, value: impl Into<String>) -> (String, String) {
    (field.to_string(), value.into())
}

/// Full metadata record for a create/replace.
pub fn encode_meta(
    snapshot: &WorkspaceSnapshot,
    version: i64,
    updated_at: DateTime<Utc>,
) -> Result<Vec<(String, String)>> {
    Ok(vec![
        pair(FIELD_TOKEN, snapshot.token.as_str()),
        pair(FIELD_OWNER, snapshot.owner_id.to_string()),
        pair(FIELD_TOPIC, snapshot.topic.as_str()),
        pair(FIELD_LANGUAGE, snapshot.language.as_str()),
        pair(FIELD_TARGET, snapshot.generation_target.as_str()),
        pair(FIELD_BODY, snapshot.draft_body.as_str()),
        pair(FIELD_ARTIFACT, snapshot.committed_artifact_id.to_string()),
        pair(FIELD_STATUS, snapshot.status.as_str()),
        pair(FIELD_VERSION, version.to_string()),
        pair(FIELD_LINKED_VERSION, snapshot.linked_version.to_string()),
        pair(FIELD_UPDATED_AT, updated_at.timestamp_millis().to_string()),
        pair(FIELD_EXTRA, serde_json::to_string(&snapshot.extra)?),
    ])
}

/// Fields written by a metadata patch, plus the touch timestamp.
pub fn encode_patch(patch: &MetadataPatch, updated_at: DateTime<Utc>) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::new();
    if let Some(topic) = &patch.topic {
        fields.push(pair(FIELD_TOPIC, topic.as_str()));
    }
    if let Some(language) = &patch.language {
        fields.push(pair(FIELD_LANGUAGE, language.as_str()));
    }
    if let Some(target) = &patch.generation_target {
        fields.push(pair(FIELD_TARGET, target.as_str()));
    }
    if let Some(body) = &patch.draft_body {
        fields.push(pair(FIELD_BODY, body.as_str()));
    }
    if let Some(extra) = &patch.extra {
        fields.push(pair(FIELD_EXTRA, serde_json::to_string(extra)?));
    }
    fields.push(touched(updated_at));
    Ok(fields)
}

/// Fields recording a successful write-back.
///
/// The linked version is raised separately with [`StoreCommand::HSetMax`].
///
/// [`StoreCommand::HSetMax`]: crate::store::StoreCommand::HSetMax
pub fn encode_linkage(artifact_id: i64, status: &str, updated_at: DateTime<Utc>) -> Vec<(String, String)> {
    vec![
        pair(FIELD_ARTIFACT, artifact_id.to_string()),
        pair(FIELD_STATUS, status),
        touched(updated_at),
    ]
}

pub fn touched(updated_at: DateTime<Utc>) -> (String, String) {
    pair(FIELD_UPDATED_AT, updated_at.timestamp_millis().to_string())
}

fn int_field(meta: &HashMap<String, String>, field: &str) -> Result<i64> {
    match meta.get(field) {
        Some(raw) if !raw.is_empty() => raw.parse::<i64>().map_err(|_| {
            Error::invalid_input(format!("workspace field {field} is not an integer: {raw}"))
        }),
        _ => Ok(0),
    }
}

fn text_field(meta: &HashMap<String, String>, field: &str) -> String {
    meta.get(field).cloned().unwrap_or_default()
}

/// Rebuild snapshot metadata from the hash. Keyword lists are left empty.
pub fn decode_meta(owner_id: i64, token: &str, meta: &HashMap<String, String>) -> Result<WorkspaceSnapshot> {
    let updated_at = Utc
        .timestamp_millis_opt(int_field(meta, FIELD_UPDATED_AT)?)
        .single()
        .unwrap_or_else(Utc::now);

    let extra: BTreeMap<String, String> = match meta.get(FIELD_EXTRA) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
        _ => BTreeMap::new(),
    };

    Ok(WorkspaceSnapshot {
        token: token.to_string(),
        owner_id,
        topic: text_field(meta, FIELD_TOPIC),
        language: text_field(meta, FIELD_LANGUAGE),
        generation_target: text_field(meta, FIELD_TARGET),
        draft_body: text_field(meta, FIELD_BODY),
        positive_keywords: Vec::new(),
        negative_keywords: Vec::new(),
        committed_artifact_id: int_field(meta, FIELD_ARTIFACT)?,
        status: text_field(meta, FIELD_STATUS),
        version: int_field(meta, FIELD_VERSION)?,
        linked_version: int_field(meta, FIELD_LINKED_VERSION)?,
        updated_at,
        extra,
    })
}
