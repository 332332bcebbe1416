use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status value for active rows (tasks, feeds, articles).
pub const STATUS_ACTIVE: i64 = 1;

/// Fixed textual timestamp format used for every stored timestamp (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current UTC time in [`TIMESTAMP_FORMAT`].
pub fn now_timestamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of feedbrief appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A JSON column could not be decoded
    #[error("Corrupt {column} column: {source}")]
    Decode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

/// True if the error is a UNIQUE / PRIMARY KEY constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted,
    /// A row with the same key already existed; nothing was written.
    AlreadyExists,
}

// ============================================================================
// Inputs (owned by the management layer)
// ============================================================================

/// A tracked content source.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Feed {
    pub id: String,
    pub name: String,
    /// Opaque key handed to the listing source (a URL for the HTTP source).
    pub source_key: String,
    pub status: i64,
    pub update_time: Option<String>,
    pub sync_time: Option<String>,
}

/// A tag groups feeds. `feed_refs` is the raw member encoding as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub feed_refs: Option<String>,
}

/// A scheduled collection job.
///
/// `feed_refs` and `tag_refs` are stored in whatever shape the management
/// layer wrote them; see `feed::resolver` for the accepted encodings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub cron_exp: Option<String>,
    pub feed_refs: Option<String>,
    pub tag_refs: Option<String>,
    pub status: i64,
    pub notification_url: Option<String>,
}

// ============================================================================
// Pipeline-owned rows
// ============================================================================

/// A stored article.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Article {
    /// Composite `{feed_id}-{source_id}` key.
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub url: Option<String>,
    pub content: Option<String>,
    pub publish_time: Option<i64>,
    pub status: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Article {
    /// True if the article carries non-blank body text.
    pub fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

/// One key point of a brief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub title: String,
    pub detail: String,
}

/// An AI-generated summary of one article.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Brief {
    pub id: String,
    /// The article id this brief belongs to (unique).
    pub article_key: String,
    pub model: String,
    pub summary: String,
    pub highlights: Vec<Highlight>,
    pub version: String,
    pub language: String,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,
    pub generated_at: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Internal row type for brief queries; JSON columns are decoded in
/// [`BriefRow::into_brief`].
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BriefRow {
    pub id: String,
    pub article_key: String,
    pub model: String,
    pub summary: String,
    pub highlights: String,
    pub version: String,
    pub language: String,
    pub tags: String,
    pub confidence: Option<f64>,
    pub generated_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl BriefRow {
    pub(crate) fn into_brief(self) -> Result<Brief, DatabaseError> {
        let highlights = serde_json::from_str(&self.highlights).map_err(|source| {
            DatabaseError::Decode {
                column: "briefs.highlights",
                source,
            }
        })?;
        let tags = serde_json::from_str(&self.tags).map_err(|source| DatabaseError::Decode {
            column: "briefs.tags",
            source,
        })?;
        Ok(Brief {
            id: self.id,
            article_key: self.article_key,
            model: self.model,
            summary: self.summary,
            highlights,
            version: self.version,
            language: self.language,
            tags,
            confidence: self.confidence,
            generated_at: self.generated_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Aggregate article counts for operator reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleStats {
    pub total: i64,
    pub with_content: i64,
    pub without_content: i64,
    /// Articles whose status is not active
    pub inactive: i64,
    /// Number of tracked feeds
    pub feeds: i64,
}
