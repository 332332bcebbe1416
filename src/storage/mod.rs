mod articles;
mod briefs;
mod feeds;
mod schema;
mod tasks;
mod types;

pub use schema::Database;
pub use types::{
    now_timestamp, Article, ArticleStats, Brief, DatabaseError, Feed, Highlight, InsertOutcome,
    Tag, Task, STATUS_ACTIVE, TIMESTAMP_FORMAT,
};
