//! Key layout for one workspace.

use crate::types::Polarity;

/// The four shared-store keys backing a workspace.
///
/// All keys are namespaced by owner so one principal can never address
/// another principal's workspace, even with a leaked token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceKeys {
    /// Hash with the metadata record.
    pub meta: String,
    /// Sorted set of positive keyword keys by ranking score.
    pub positive_rank: String,
    /// Sorted set of negative keyword keys by ranking score.
    pub negative_rank: String,
    /// Hash of keyword detail records, field `{polarity}:{key}`.
    pub detail: String,
}

impl WorkspaceKeys {
    pub fn new(prefix: &str, owner_id: i64, token: &str) -> Self {
        let base = format!("{prefix}:ws:{owner_id}:{token}");
        Self {
            meta: format!("{base}:meta"),
            positive_rank: format!("{base}:rank:positive"),
            negative_rank: format!("{base}:rank:negative"),
            detail: format!("{base}:detail"),
        }
    }

    /// Ranked collection for one polarity.
    pub fn rank(&self, polarity: Polarity) -> &str {
        match polarity {
            Polarity::Positive => &self.positive_rank,
            Polarity::Negative => &self.negative_rank,
        }
    }

    /// Every key, for TTL refresh and deletion.
    pub fn all(&self) -> [&str; 4] {
        [
            &self.meta,
            &self.positive_rank,
            &self.negative_rank,
            &self.detail,
        ]
    }
}

/// Field name of a keyword inside the detail hash.
pub fn detail_field(polarity: Polarity, key: &str) -> String {
    format!("{}:{}", polarity.as_str(), key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced_by_owner() {
        let a = WorkspaceKeys::new("dc", 7, "tok");
        let b = WorkspaceKeys::new("dc", 8, "tok");
        assert_eq!(a.meta, "dc:ws:7:tok:meta");
        assert_ne!(a.meta, b.meta);
        assert_eq!(a.rank(Polarity::Negative), "dc:ws:7:tok:rank:negative");
    }

    #[test]
    fn test_all_keys_are_distinct() {
        let keys = WorkspaceKeys::new("dc", 1, "t");
        let all = keys.all();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_detail_field() {
        assert_eq!(detail_field(Polarity::Positive, "react"), "positive:react");
    }
}
