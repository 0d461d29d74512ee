//! Keyword detail records and ranking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::keys::detail_field;
use crate::error::{Error, Result};
use crate::types::{KeywordOrigin, Polarity, WorkspaceKeyword, normalize_word};

/// Stored form of one keyword in the detail hash.
///
/// Polarity and key live in the field name and the score lives in the ranked
/// collection, so neither is repeated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeywordDetail {
    word: String,
    #[serde(default)]
    origin: KeywordOrigin,
    #[serde(default = "crate::types::default_weight")]
    weight: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display: Option<String>,
}

/// Validate a keyword and recompute its key from the word.
pub fn prepare(mut keyword: WorkspaceKeyword) -> Result<WorkspaceKeyword> {
    let word = keyword.word.trim().to_string();
    if word.is_empty() {
        return Err(Error::invalid_input("keyword word must not be empty"));
    }
    keyword.key = normalize_word(&word);
    keyword.word = word;
    Ok(keyword)
}

/// Validate and collapse duplicates by polarity and key.
///
/// The last occurrence wins but keeps the position of the first, so the
/// relative order of the input is preserved.
pub fn dedup(keywords: impl IntoIterator<Item = WorkspaceKeyword>) -> Result<Vec<WorkspaceKeyword>> {
    let mut out: Vec<WorkspaceKeyword> = Vec::new();
    let mut index: HashMap<(Polarity, String), usize> = HashMap::new();

    for keyword in keywords {
        let keyword = prepare(keyword)?;
        match index.get(&(keyword.polarity, keyword.key.clone())) {
            Some(&slot) => out[slot] = keyword,
            None => {
                index.insert((keyword.polarity, keyword.key.clone()), out.len());
                out.push(keyword);
            }
        }
    }

    Ok(out)
}

/// Fill in missing ranking scores from a wall-clock base.
///
/// Each unscored keyword gets a strictly larger score than the previous one,
/// so a batch keeps its input order.
pub fn assign_scores(keywords: &mut [WorkspaceKeyword], now_ms: i64) {
    for (idx, keyword) in keywords.iter_mut().enumerate() {
        if keyword.score.is_none() {
            keyword.score = Some(now_ms as f64 + idx as f64 * 0.001);
        }
    }
}

/// Detail hash field and JSON value for a keyword.
pub fn encode_detail(keyword: &WorkspaceKeyword) -> Result<(String, String)> {
    let detail = KeywordDetail {
        word: keyword.word.clone(),
        origin: keyword.origin,
        weight: keyword.weight,
        display: keyword.display.clone(),
    };
    Ok((
        detail_field(keyword.polarity, &keyword.key),
        serde_json::to_string(&detail)?,
    ))
}

/// Rebuild the keywords of one polarity, in ranked order.
///
/// Ranked members whose detail record is missing are skipped.
pub fn assemble(
    polarity: Polarity,
    ranked: Vec<(String, f64)>,
    details: &HashMap<String, String>,
) -> Result<Vec<WorkspaceKeyword>> {
    let mut keywords = Vec::with_capacity(ranked.len());
    for (key, score) in ranked {
        let Some(raw) = details.get(&detail_field(polarity, &key)) else {
            tracing::debug!(polarity = %polarity, key = %key, "Ranked keyword without detail");
            continue;
        };
        let detail: KeywordDetail = serde_json::from_str(raw)?;
        keywords.push(WorkspaceKeyword {
            word: detail.word,
            key,
            polarity,
            origin: detail.origin,
            weight: detail.weight,
            display: detail.display,
            score: Some(score),
        });
    }
    Ok(keywords)
}
