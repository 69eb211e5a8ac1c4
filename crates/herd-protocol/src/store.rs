/// Post store: the persistence collaborator.
///
/// An abstract key-value store keyed by post id. Writes are atomic per
/// post and never overwrite: creating a post whose id already exists is a
/// no-op that reports `false`.
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::post::Post;

/// Queryable post fields for [`PostStore::get_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostField {
    Id,
    PublicKey,
    Signature,
}

impl PostField {
    fn column(&self) -> &'static str {
        match self {
            PostField::Id => "id",
            PostField::PublicKey => "public_key",
            PostField::Signature => "signature",
        }
    }

    fn read<'a>(&self, post: &'a Post) -> &'a str {
        match self {
            PostField::Id => &post.id,
            PostField::PublicKey => &post.public_key,
            PostField::Signature => &post.signature,
        }
    }
}

/// Abstract post store shared by the runtime and the application.
pub trait PostStore: Send + Sync {
    /// All posts, in insertion order.
    fn get_many(&self) -> Result<Vec<Post>, StoreError>;

    /// First post whose `field` equals `value`.
    fn get_one(&self, field: PostField, value: &str) -> Result<Option<Post>, StoreError>;

    /// Insert a post. Returns `false` if a post with that id already exists.
    fn create_one(&self, post: Post) -> Result<bool, StoreError>;

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.get_many()?.len())
    }
}

// ── In-memory store ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
    order: Vec<String>,
    posts: HashMap<String, Post>,
}

/// Volatile store for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryPostStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PostStore for MemoryPostStore {
    fn get_many(&self) -> Result<Vec<Post>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.posts.get(id).cloned())
            .collect())
    }

    fn get_one(&self, field: PostField, value: &str) -> Result<Option<Post>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        if field == PostField::Id {
            return Ok(inner.posts.get(value).cloned());
        }
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.posts.get(id))
            .find(|post| field.read(post) == value)
            .cloned())
    }

    fn create_one(&self, post: Post) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        if inner.posts.contains_key(&post.id) {
            return Ok(false);
        }
        inner.order.push(post.id.clone());
        inner.posts.insert(post.id.clone(), post);
        Ok(true)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().map_err(|_| StoreError::Poisoned)?.posts.len())
    }
}

// ── SQLite store ─────────────────────────────────────────────────────

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS posts (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    text        TEXT NOT NULL,
    latitude    TEXT NOT NULL,
    longitude   TEXT NOT NULL,
    public_key  TEXT NOT NULL,
    private_key TEXT,
    created_at  TEXT NOT NULL,
    imported_at TEXT NOT NULL,
    signature   TEXT NOT NULL,
    raw         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS posts_public_key ON posts(public_key);
";

const SELECT_COLUMNS: &str = "id, text, latitude, longitude, public_key, private_key, \
                              created_at, imported_at, signature, raw";

/// Durable store backed by a single SQLite database.
#[derive(Debug)]
pub struct SqlitePostStore {
    conn: Mutex<Connection>,
}

impl SqlitePostStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Row as read from SQLite, before timestamp parsing.
struct PostRow {
    id: String,
    text: String,
    latitude: String,
    longitude: String,
    public_key: String,
    private_key: Option<String>,
    created_at: String,
    imported_at: String,
    signature: String,
    raw: String,
}

impl PostRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            public_key: row.get(4)?,
            private_key: row.get(5)?,
            created_at: row.get(6)?,
            imported_at: row.get(7)?,
            signature: row.get(8)?,
            raw: row.get(9)?,
        })
    }

    fn into_post(self) -> Result<Post, StoreError> {
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let imported_at = parse_timestamp(&self.id, &self.imported_at)?;
        Ok(Post {
            id: self.id,
            text: self.text,
            latitude: self.latitude,
            longitude: self.longitude,
            public_key: self.public_key,
            private_key: self.private_key,
            created_at,
            imported_at,
            signature: self.signature,
            raw: self.raw,
        })
    }
}

fn parse_timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow {
            id: id.to_string(),
            reason: format!("timestamp {value:?}: {e}"),
        })
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl PostStore for SqlitePostStore {
    fn get_many(&self) -> Result<Vec<Post>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM posts ORDER BY seq"))?;
        let rows = stmt
            .query_map([], PostRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PostRow::into_post).collect()
    }

    fn get_one(&self, field: PostField, value: &str) -> Result<Option<Post>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM posts WHERE {} = ?1 ORDER BY seq LIMIT 1",
            field.column()
        );
        let row = conn
            .query_row(&sql, params![value], PostRow::from_row)
            .optional()?;
        row.map(PostRow::into_post).transpose()
    }

    fn create_one(&self, post: Post) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO posts \
             (id, text, latitude, longitude, public_key, private_key, created_at, imported_at, signature, raw) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                post.id,
                post.text,
                post.latitude,
                post.longitude,
                post.public_key,
                post.private_key,
                format_timestamp(&post.created_at),
                format_timestamp(&post.imported_at),
                post.signature,
                post.raw,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
