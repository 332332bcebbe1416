//! Task → feed list resolution.
//!
//! Tasks and tags store their member feeds as loosely encoded text written
//! by the management layer. All of these are accepted:
//!
//! - `["a", "b"]`
//! - `[{"id": "a"}, {"id": 2}]`
//! - `a, b`

use serde_json::Value;

use crate::storage::{Database, DatabaseError, Feed, Task};

/// Parse a stored feed or tag reference field into ids, in order, without
/// duplicates. Malformed entries are skipped with a warning.
pub fn parse_refs(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Vec::new();
    };

    let ids: Vec<String> = if raw.starts_with('[') || raw.starts_with('{') || raw.starts_with('"') {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items.iter().filter_map(ref_entry_id).collect(),
            Ok(single) => ref_entry_id(&single).into_iter().collect(),
            Err(e) => {
                tracing::warn!(refs = %raw, error = %e, "Malformed feed reference list, ignoring");
                Vec::new()
            }
        }
    } else {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };

    let mut unique = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    unique
}

fn ref_entry_id(entry: &Value) -> Option<String> {
    let id = match entry {
        Value::Object(map) => map.get("id").and_then(scalar_id),
        other => scalar_id(other),
    };
    if id.is_none() {
        tracing::warn!(entry = %entry, "Skipping malformed feed reference");
    }
    id
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Expands tasks into the feeds they cover.
#[derive(Clone)]
pub struct FeedResolver {
    db: Database,
}

impl FeedResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve a task into an ordered, deduplicated feed list.
    ///
    /// Explicit feed refs come first, then members of each referenced tag.
    /// With no task, no ids, or no matching feeds, every known feed is
    /// returned. Storage failures are logged and yield an empty list.
    pub async fn get_feeds(&self, task: Option<&Task>) -> Vec<Feed> {
        match self.resolve(task).await {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::error!(
                    task_id = task.map(|t| t.id.as_str()).unwrap_or("-"),
                    error = %e,
                    "Failed to resolve task feeds"
                );
                Vec::new()
            }
        }
    }

    async fn resolve(&self, task: Option<&Task>) -> Result<Vec<Feed>, DatabaseError> {
        let Some(task) = task else {
            return self.db.get_all_feeds().await;
        };

        let mut ids = parse_refs(task.feed_refs.as_deref());
        for tag_id in parse_refs(task.tag_refs.as_deref()) {
            match self.db.get_tag(&tag_id).await? {
                Some(tag) => {
                    for id in parse_refs(tag.feed_refs.as_deref()) {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                None => tracing::warn!(task_id = %task.id, tag_id = %tag_id, "Unknown tag, skipping"),
            }
        }

        if ids.is_empty() {
            tracing::debug!(task_id = %task.id, "Task has no feed references, using all feeds");
            return self.db.get_all_feeds().await;
        }

        let feeds = self.db.get_feeds_by_ids(&ids).await?;
        if feeds.is_empty() {
            tracing::warn!(task_id = %task.id, "No referenced feed exists, using all feeds");
            return self.db.get_all_feeds().await;
        }
        Ok(feeds)
    }
}
