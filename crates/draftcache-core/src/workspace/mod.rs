//! Workspace cache.
//!
//! Fast, TTL-bounded storage of one editing session's draft state. Each
//! workspace lives under four store keys (see [`WorkspaceKeys`]). Every
//! mutation is a single [`SharedStore::exec`] batch that also refreshes the
//! TTL of all four keys, so partial writes are never observable and sibling
//! keys never drift apart.
//!
//! The cache assumes its store is reachable and returns errors otherwise;
//! routing around an outage is the caller's job.

mod keys;
mod keywords;
mod record;

pub use keys::{WorkspaceKeys, detail_field};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::WorkspaceConfig;
use crate::error::{Error, Result};
use crate::store::{SharedStore, StoreCommand, StoreRead, expire_all};
use crate::types::{MetadataPatch, Polarity, WorkspaceKeyword, WorkspaceSnapshot, normalize_word};

/// Structured, TTL-bounded session storage over a [`SharedStore`].
pub struct WorkspaceCache {
    store: Arc<dyn SharedStore>,
    config: WorkspaceConfig,
}

fn check_scope(owner_id: i64, token: &str) -> Result<()> {
    if owner_id <= 0 {
        return Err(Error::invalid_input(format!("invalid owner id {owner_id}")));
    }
    if token.trim().is_empty() {
        return Err(Error::invalid_input("workspace token must not be empty"));
    }
    Ok(())
}

fn parse_counter(raw: Option<&String>) -> i64 {
    raw.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0)
}

impl WorkspaceCache {
    pub fn new(store: Arc<dyn SharedStore>, config: WorkspaceConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Check that the backing store answers.
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Store keys of one workspace.
    pub fn keys(&self, owner_id: i64, token: &str) -> WorkspaceKeys {
        WorkspaceKeys::new(&self.config.key_prefix, owner_id, token)
    }

    fn refresh(&self, commands: &mut Vec<StoreCommand>, keys: &WorkspaceKeys) {
        expire_all(commands, keys.all(), self.config.idle_ttl());
    }

    async fn ensure_exists(&self, owner_id: i64, token: &str, keys: &WorkspaceKeys) -> Result<()> {
        if self.store.exists(&keys.meta).await? {
            return Ok(());
        }
        debug!(owner_id = owner_id, token = %token, "Workspace missing or expired");
        Err(Error::not_found("workspace", token))
    }

    /// Apply a mutation batch only if the workspace is still live.
    ///
    /// The existence check runs inside the batch, so a delete or expiry that
    /// lands first fails the batch instead of leaving a partial workspace.
    async fn exec_guarded(
        &self,
        owner_id: i64,
        token: &str,
        keys: &WorkspaceKeys,
        commands: Vec<StoreCommand>,
    ) -> Result<()> {
        let mut batch = Vec::with_capacity(commands.len() + 1);
        batch.push(StoreCommand::RequireExists {
            key: keys.meta.clone(),
        });
        batch.extend(commands);

        self.store.exec(batch).await.map_err(|e| {
            if e.is_not_found() {
                debug!(owner_id = owner_id, token = %token, "Workspace missing or expired");
                Error::not_found("workspace", token)
            } else {
                e
            }
        })
    }

    /// Write a whole snapshot, replacing any existing workspace under its token.
    ///
    /// Assigns a token when the snapshot has none. The stored version becomes
    /// one past the larger of the stored and supplied versions.
    pub async fn create_or_replace(&self, owner_id: i64, snapshot: WorkspaceSnapshot) -> Result<String> {
        let mut snapshot = snapshot;
        if snapshot.topic.trim().is_empty() {
            return Err(Error::invalid_input("workspace topic must not be empty"));
        }
        if snapshot.token.trim().is_empty() {
            snapshot.token = Uuid::new_v4().simple().to_string();
        }
        check_scope(owner_id, &snapshot.token)?;
        snapshot.owner_id = owner_id;

        let token = snapshot.token.clone();
        let keys = self.keys(owner_id, &token);

        if snapshot.committed_artifact_id == 0 {
            let stored = self.store.hget(&keys.meta, record::FIELD_ARTIFACT).await?;
            snapshot.committed_artifact_id = parse_counter(stored.as_ref());
        }

        let supplied = snapshot
            .positive_keywords
            .drain(..)
            .map(|mut k| {
                k.polarity = Polarity::Positive;
                k
            })
            .chain(snapshot.negative_keywords.drain(..).map(|mut k| {
                k.polarity = Polarity::Negative;
                k
            }))
            .collect::<Vec<_>>();
        let mut keywords = keywords::dedup(supplied)?;
        keywords::assign_scores(&mut keywords, Utc::now().timestamp_millis());

        // The meta hash has a fixed field set, so overwriting it replaces it.
        // Counters are raised in place so a concurrent bump or link is kept.
        let mut meta = record::encode_meta(&snapshot, snapshot.version, Utc::now())?;
        meta.retain(|(field, _)| field != record::FIELD_VERSION && field != record::FIELD_LINKED_VERSION);

        let mut commands: Vec<StoreCommand> = [&keys.positive_rank, &keys.negative_rank, &keys.detail]
            .into_iter()
            .map(|key| StoreCommand::Del { key: key.clone() })
            .collect();
        commands.extend([
            StoreCommand::HSet {
                key: keys.meta.clone(),
                fields: meta,
            },
            StoreCommand::HSetMax {
                key: keys.meta.clone(),
                field: record::FIELD_VERSION.to_string(),
                value: snapshot.version,
            },
            StoreCommand::HIncrBy {
                key: keys.meta.clone(),
                field: record::FIELD_VERSION.to_string(),
                delta: 1,
            },
            StoreCommand::HSetMax {
                key: keys.meta.clone(),
                field: record::FIELD_LINKED_VERSION.to_string(),
                value: snapshot.linked_version,
            },
        ]);
        self.push_keywords(&mut commands, &keys, &keywords)?;
        self.refresh(&mut commands, &keys);

        self.store.exec(commands).await?;

        info!(
            owner_id = owner_id,
            token = %token,
            keywords = keywords.len(),
            "Workspace written"
        );
        Ok(token)
    }

    fn push_keywords(
        &self,
        commands: &mut Vec<StoreCommand>,
        keys: &WorkspaceKeys,
        keywords: &[WorkspaceKeyword],
    ) -> Result<()> {
        for polarity in Polarity::ALL {
            let members: Vec<(String, f64)> = keywords
                .iter()
                .filter(|k| k.polarity == polarity)
                .map(|k| (k.key.clone(), k.score.unwrap_or_default()))
                .collect();
            if !members.is_empty() {
                commands.push(StoreCommand::ZAdd {
                    key: keys.rank(polarity).to_string(),
                    members,
                });
            }
        }

        if !keywords.is_empty() {
            let fields = keywords
                .iter()
                .map(keywords::encode_detail)
                .collect::<Result<Vec<_>>>()?;
            commands.push(StoreCommand::HSet {
                key: keys.detail.clone(),
                fields,
            });
        }
        Ok(())
    }

    fn bump_version(commands: &mut Vec<StoreCommand>, keys: &WorkspaceKeys) {
        commands.push(StoreCommand::HIncrBy {
            key: keys.meta.clone(),
            field: record::FIELD_VERSION.to_string(),
            delta: 1,
        });
        commands.push(StoreCommand::HSet {
            key: keys.meta.clone(),
            fields: vec![record::touched(Utc::now())],
        });
    }

    /// Upsert keywords by polarity and normalized word.
    ///
    /// Existing entries are overwritten and re-ranked; unrelated keywords are
    /// left alone. Empty input is a no-op.
    pub async fn merge_keywords(
        &self,
        owner_id: i64,
        token: &str,
        keywords: Vec<WorkspaceKeyword>,
    ) -> Result<()> {
        check_scope(owner_id, token)?;
        if keywords.is_empty() {
            return Ok(());
        }
        let mut keywords = keywords::dedup(keywords)?;
        keywords::assign_scores(&mut keywords, Utc::now().timestamp_millis());

        let keys = self.keys(owner_id, token);

        let mut commands = Vec::new();
        self.push_keywords(&mut commands, &keys, &keywords)?;
        Self::bump_version(&mut commands, &keys);
        self.refresh(&mut commands, &keys);

        self.exec_guarded(owner_id, token, &keys, commands).await?;
        debug!(owner_id = owner_id, token = %token, count = keywords.len(), "Keywords merged");
        Ok(())
    }

    /// Remove one keyword. Returns whether it was present.
    pub async fn remove_keyword(
        &self,
        owner_id: i64,
        token: &str,
        polarity: Polarity,
        word: &str,
    ) -> Result<bool> {
        check_scope(owner_id, token)?;
        let key = normalize_word(word);
        if key.is_empty() {
            return Err(Error::invalid_input("keyword word must not be empty"));
        }

        let keys = self.keys(owner_id, token);
        self.ensure_exists(owner_id, token, &keys).await?;

        let field = detail_field(polarity, &key);
        if self.store.hget(&keys.detail, &field).await?.is_none() {
            return Ok(false);
        }

        let mut commands = vec![
            StoreCommand::ZRem {
                key: keys.rank(polarity).to_string(),
                members: vec![key.clone()],
            },
            StoreCommand::HDel {
                key: keys.detail.clone(),
                fields: vec![field],
            },
        ];
        Self::bump_version(&mut commands, &keys);
        self.refresh(&mut commands, &keys);

        self.exec_guarded(owner_id, token, &keys, commands).await?;
        debug!(owner_id = owner_id, token = %token, polarity = %polarity, key = %key, "Keyword removed");
        Ok(true)
    }

    pub async fn update_draft_body(&self, owner_id: i64, token: &str, body: impl Into<String>) -> Result<()> {
        self.patch_metadata(owner_id, token, MetadataPatch::draft_body(body))
            .await
    }

    /// Patch metadata fields. An empty patch is a no-op.
    pub async fn patch_metadata(&self, owner_id: i64, token: &str, patch: MetadataPatch) -> Result<()> {
        check_scope(owner_id, token)?;
        if patch.topic.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(Error::invalid_input("workspace topic must not be empty"));
        }
        if patch.is_empty() {
            return Ok(());
        }

        let keys = self.keys(owner_id, token);

        let mut commands = vec![StoreCommand::HSet {
            key: keys.meta.clone(),
            fields: record::encode_patch(&patch, Utc::now())?,
        }];
        commands.push(StoreCommand::HIncrBy {
            key: keys.meta.clone(),
            field: record::FIELD_VERSION.to_string(),
            delta: 1,
        });
        self.refresh(&mut commands, &keys);

        self.exec_guarded(owner_id, token, &keys, commands).await?;
        debug!(owner_id = owner_id, token = %token, "Workspace metadata patched");
        Ok(())
    }

    /// Record a successful write-back. Does not bump the version.
    ///
    /// The linked version never moves backwards.
    pub async fn set_artifact_linkage(
        &self,
        owner_id: i64,
        token: &str,
        artifact_id: i64,
        status: &str,
        linked_version: i64,
    ) -> Result<()> {
        check_scope(owner_id, token)?;
        if artifact_id <= 0 {
            return Err(Error::invalid_input(format!("invalid artifact id {artifact_id}")));
        }

        let keys = self.keys(owner_id, token);

        let mut commands = vec![
            StoreCommand::HSet {
                key: keys.meta.clone(),
                fields: record::encode_linkage(artifact_id, status, Utc::now()),
            },
            StoreCommand::HSetMax {
                key: keys.meta.clone(),
                field: record::FIELD_LINKED_VERSION.to_string(),
                value: linked_version,
            },
        ];
        self.refresh(&mut commands, &keys);

        self.exec_guarded(owner_id, token, &keys, commands).await?;
        info!(
            owner_id = owner_id,
            token = %token,
            artifact_id = artifact_id,
            linked_version = linked_version,
            "Workspace linked to artifact"
        );
        Ok(())
    }

    /// Read the full workspace, keywords in ranked order.
    pub async fn snapshot(&self, owner_id: i64, token: &str) -> Result<WorkspaceSnapshot> {
        check_scope(owner_id, token)?;
        let keys = self.keys(owner_id, token);

        // One consistent read, so a concurrent replace is seen whole or not at all.
        let mut values = self
            .store
            .read_all(vec![
                StoreRead::Hash(keys.meta.clone()),
                StoreRead::Hash(keys.detail.clone()),
                StoreRead::Ranked(keys.positive_rank.clone()),
                StoreRead::Ranked(keys.negative_rank.clone()),
            ])
            .await?
            .into_iter();
        let mut next = || {
            values
                .next()
                .ok_or_else(|| Error::store_unavailable("short read from store"))
        };

        let meta = next()?.into_hash()?;
        if meta.is_empty() {
            return Err(Error::not_found("workspace", token));
        }
        let details = next()?.into_hash()?;
        let positive = next()?.into_ranked()?;
        let negative = next()?.into_ranked()?;

        let mut snapshot = record::decode_meta(owner_id, token, &meta)?;
        for (polarity, ranked) in [(Polarity::Positive, positive), (Polarity::Negative, negative)] {
            let keywords = keywords::assemble(polarity, ranked, &details)?;
            match polarity {
                Polarity::Positive => snapshot.positive_keywords = keywords,
                Polarity::Negative => snapshot.negative_keywords = keywords,
            }
        }

        Ok(snapshot)
    }

    /// Keep an active workspace alive without changing it.
    pub async fn touch(&self, owner_id: i64, token: &str) -> Result<()> {
        check_scope(owner_id, token)?;
        let keys = self.keys(owner_id, token);

        let mut commands = Vec::new();
        self.refresh(&mut commands, &keys);
        self.exec_guarded(owner_id, token, &keys, commands).await
    }

    /// Remove every key of a workspace. Returns whether it existed.
    pub async fn delete(&self, owner_id: i64, token: &str) -> Result<bool> {
        check_scope(owner_id, token)?;
        let keys = self.keys(owner_id, token);
        let existed = self.store.exists(&keys.meta).await?;

        let commands = keys
            .all()
            .into_iter()
            .map(|key| StoreCommand::Del { key: key.to_string() })
            .collect();
        self.store.exec(commands).await?;

        if existed {
            info!(owner_id = owner_id, token = %token, "Workspace deleted");
        }
        Ok(existed)
    }

    /// Remaining lifetime of each workspace key, in [`WorkspaceKeys::all`] order.
    pub async fn ttls(&self, owner_id: i64, token: &str) -> Result<Vec<Option<Duration>>> {
        let keys = self.keys(owner_id, token);
        let mut ttls = Vec::with_capacity(4);
        for key in keys.all() {
            ttls.push(self.store.ttl(key).await?);
        }
        Ok(ttls)
    }
}
