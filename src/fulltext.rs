//! Ranked full-text index keyed on `(collection, doc_id)`.
//!
//! Backed by a SQLite FTS5 virtual table. Ranking is Okapi BM25 as
//! computed by `bm25()`: ascending (more negative = better) in the raw
//! index, sign-flipped to a descending `score` at this edge. Snippets
//! come from `snippet()` with configurable tags and ellipses.
//!
//! Query text is sanitized into quoted phrases per whitespace token, so
//! hyphenated tokens like `A-B` stay one phrase instead of parsing as a
//! NOT operator. With CJK mode on, runs of CJK codepoints are segmented
//! into single-character tokens before both indexing and querying, and
//! the stemming tokenizer is swapped for plain `unicode61`.

use crate::config;
use crate::document::split_composite_key;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;

/// Configuration for the full-text index.
#[derive(Debug, Clone, Default)]
pub struct FullTextConfig {
    /// Segment CJK runs into single-character tokens and disable stemming.
    pub cjk: bool,
}

/// A ranked full-text hit.
#[derive(Debug, Clone)]
pub struct FullTextHit {
    pub doc_id: String,
    pub collection: String,
    pub snippet: String,
    /// BM25-derived score, higher = more relevant. Unranked listings
    /// report 0.
    pub score: f32,
    pub metadata: Value,
}

/// Options for [`FullTextIndex::search`].
#[derive(Debug, Clone, Default)]
pub struct FullTextSearchOptions {
    pub limit: usize,
    /// Restrict hits to one collection.
    pub collection: Option<String>,
}

/// Options for [`FullTextIndex::advanced_search`].
#[derive(Debug, Clone)]
pub struct AdvancedSearchOptions {
    pub limit: usize,
    pub collection: Option<String>,
    /// Opening tag wrapped around snippet matches.
    pub open_tag: String,
    /// Closing tag wrapped around snippet matches.
    pub close_tag: String,
    /// Marker for truncated snippet boundaries.
    pub ellipsis: String,
    /// Approximate snippet window in tokens (FTS5 caps this at 64).
    pub snippet_tokens: u32,
    /// Include the BM25-derived score.
    pub with_score: bool,
    /// Include the fully highlighted content.
    pub with_highlight: bool,
}

impl Default for AdvancedSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            collection: None,
            open_tag: config::SNIPPET_OPEN_TAG.to_string(),
            close_tag: config::SNIPPET_CLOSE_TAG.to_string(),
            ellipsis: config::SNIPPET_ELLIPSIS.to_string(),
            snippet_tokens: config::SNIPPET_TOKENS,
            with_score: true,
            with_highlight: false,
        }
    }
}

/// A hit from [`FullTextIndex::advanced_search`].
#[derive(Debug, Clone)]
pub struct AdvancedHit {
    pub doc_id: String,
    pub collection: String,
    pub snippet: String,
    pub score: Option<f32>,
    pub highlight: Option<String>,
    pub metadata: Value,
}

/// Aggregate counters for the full-text index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTextStats {
    pub rows: u64,
    pub collections: u64,
}

/// Ranked text index over short documents.
pub struct FullTextIndex {
    conn: Mutex<Connection>,
    config: FullTextConfig,
}

impl FullTextIndex {
    /// Open or create the index at `path`.
    pub fn open(path: &Path, config: FullTextConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let tokenizer = if config.cjk {
            "unicode61"
        } else {
            "porter unicode61"
        };
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS fts_documents USING fts5(
                doc_id UNINDEXED,
                collection UNINDEXED,
                content,
                metadata UNINDEXED,
                tokenize = '{tokenizer}'
            );
            CREATE TABLE IF NOT EXISTS fts_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );"
        ))?;

        let index = Self {
            conn: Mutex::new(conn),
            config,
        };
        match index.get_meta("tokenizer")? {
            Some(persisted) if persisted != tokenizer => {
                tracing::warn!(
                    persisted,
                    configured = tokenizer,
                    "full-text tokenizer changed; existing rows keep the old tokenization"
                );
            }
            Some(_) => {}
            None => index.put_meta("tokenizer", tokenizer)?,
        }
        Ok(index)
    }

    /// Insert or replace the row for `(collection, doc_id)`.
    ///
    /// Composite `"coll:id"` keys are decomposed first so a logical
    /// document never produces two ranked hits.
    pub fn add(&self, doc_id: &str, collection: &str, content: &str, metadata: &Value) -> Result<()> {
        let (collection, doc_id) = decompose_key(doc_id, collection);
        let stored = if self.config.cjk {
            segment_cjk(content)
        } else {
            content.to_string()
        };
        let metadata_text = serde_json::to_string(metadata)
            .map_err(|e| Error::InvalidStoredValue(format!("metadata encode: {e}")))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM fts_documents WHERE doc_id = ?1 AND collection = ?2",
            params![doc_id, collection],
        )?;
        tx.execute(
            "INSERT INTO fts_documents (doc_id, collection, content, metadata)
             VALUES (?1, ?2, ?3, ?4)",
            params![doc_id, collection, stored, metadata_text],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove the row for `(collection, doc_id)`. No-op when absent.
    pub fn remove(&self, doc_id: &str, collection: &str) -> Result<()> {
        let (collection, doc_id) = decompose_key(doc_id, collection);
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM fts_documents WHERE doc_id = ?1 AND collection = ?2",
            params![doc_id, collection],
        )?;
        Ok(())
    }

    /// Ranked search, score descending. Empty or wildcard-only queries
    /// return the first `limit` rows in rowid order, unranked.
    pub fn search(&self, query: &str, opts: &FullTextSearchOptions) -> Result<Vec<FullTextHit>> {
        let limit = if opts.limit == 0 { 10 } else { opts.limit };
        let Some(match_expr) = self.build_match_expr(query) else {
            return self.unranked_listing(limit, opts.collection.as_deref());
        };

        let conn = self.conn.lock();
        let (sql, collection_filter) = match opts.collection.as_deref() {
            Some(_) => (
                format!(
                    "SELECT doc_id, collection,
                            snippet(fts_documents, 2, '{}', '{}', '{}', {}),
                            bm25(fts_documents), metadata
                     FROM fts_documents
                     WHERE fts_documents MATCH ?1 AND collection = ?2
                     ORDER BY bm25(fts_documents) ASC, doc_id ASC
                     LIMIT {limit}",
                    config::SNIPPET_OPEN_TAG,
                    config::SNIPPET_CLOSE_TAG,
                    config::SNIPPET_ELLIPSIS,
                    config::SNIPPET_TOKENS,
                ),
                true,
            ),
            None => (
                format!(
                    "SELECT doc_id, collection,
                            snippet(fts_documents, 2, '{}', '{}', '{}', {}),
                            bm25(fts_documents), metadata
                     FROM fts_documents
                     WHERE fts_documents MATCH ?1
                     ORDER BY bm25(fts_documents) ASC, doc_id ASC
                     LIMIT {limit}",
                    config::SNIPPET_OPEN_TAG,
                    config::SNIPPET_CLOSE_TAG,
                    config::SNIPPET_ELLIPSIS,
                    config::SNIPPET_TOKENS,
                ),
                false,
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let doc_id: String = row.get(0)?;
            let collection: String = row.get(1)?;
            let snippet: String = row.get(2)?;
            let raw_score: f64 = row.get(3)?;
            let metadata_text: String = row.get(4)?;
            Ok((doc_id, collection, snippet, raw_score, metadata_text))
        };
        let rows: Vec<_> = if collection_filter {
            stmt.query_map(
                params![match_expr, opts.collection.as_deref().unwrap_or_default()],
                map_row,
            )?
            .collect::<rusqlite::Result<_>>()?
        } else {
            stmt.query_map(params![match_expr], map_row)?
                .collect::<rusqlite::Result<_>>()?
        };

        rows.into_iter()
            .map(|(doc_id, collection, snippet, raw_score, metadata_text)| {
                Ok(FullTextHit {
                    doc_id,
                    collection,
                    snippet,
                    // bm25() is ascending-is-better; flip to descending here.
                    score: -raw_score as f32,
                    metadata: parse_metadata(&metadata_text)?,
                })
            })
            .collect()
    }

    /// Ranked search with configurable snippet tags/size and optional
    /// score and highlight fields.
    pub fn advanced_search(&self, query: &str, opts: &AdvancedSearchOptions) -> Result<Vec<AdvancedHit>> {
        let limit = if opts.limit == 0 { 10 } else { opts.limit };
        let Some(match_expr) = self.build_match_expr(query) else {
            let plain = self.unranked_listing(limit, opts.collection.as_deref())?;
            return Ok(plain
                .into_iter()
                .map(|hit| AdvancedHit {
                    doc_id: hit.doc_id,
                    collection: hit.collection,
                    snippet: hit.snippet,
                    score: opts.with_score.then_some(0.0),
                    highlight: None,
                    metadata: hit.metadata,
                })
                .collect());
        };

        let highlight_expr = if opts.with_highlight {
            "highlight(fts_documents, 2, ?2, ?3)"
        } else {
            "NULL"
        };
        let collection_clause = if opts.collection.is_some() {
            "AND collection = ?6"
        } else {
            ""
        };
        let sql = format!(
            "SELECT doc_id, collection,
                    snippet(fts_documents, 2, ?2, ?3, ?4, ?5),
                    bm25(fts_documents), metadata, {highlight_expr}
             FROM fts_documents
             WHERE fts_documents MATCH ?1 {collection_clause}
             ORDER BY bm25(fts_documents) ASC, doc_id ASC
             LIMIT {limit}"
        );

        let snippet_tokens = opts.snippet_tokens.clamp(1, 64);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let doc_id: String = row.get(0)?;
            let collection: String = row.get(1)?;
            let snippet: String = row.get(2)?;
            let raw_score: f64 = row.get(3)?;
            let metadata_text: String = row.get(4)?;
            let highlight: Option<String> = row.get(5)?;
            Ok((doc_id, collection, snippet, raw_score, metadata_text, highlight))
        };
        let rows: Vec<_> = if let Some(collection) = opts.collection.as_deref() {
            stmt.query_map(
                params![
                    match_expr,
                    opts.open_tag,
                    opts.close_tag,
                    opts.ellipsis,
                    snippet_tokens,
                    collection
                ],
                map_row,
            )?
            .collect::<rusqlite::Result<_>>()?
        } else {
            stmt.query_map(
                params![
                    match_expr,
                    opts.open_tag,
                    opts.close_tag,
                    opts.ellipsis,
                    snippet_tokens
                ],
                map_row,
            )?
            .collect::<rusqlite::Result<_>>()?
        };

        rows.into_iter()
            .map(|(doc_id, collection, snippet, raw_score, metadata_text, highlight)| {
                Ok(AdvancedHit {
                    doc_id,
                    collection,
                    snippet,
                    score: opts.with_score.then_some(-raw_score as f32),
                    highlight,
                    metadata: parse_metadata(&metadata_text)?,
                })
            })
            .collect()
    }

    /// Remove every row.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM fts_documents", [])?;
        Ok(())
    }

    /// Remove every row in one collection.
    pub fn clear_collection(&self, collection: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM fts_documents WHERE collection = ?1",
            params![collection],
        )?;
        Ok(())
    }

    /// Row and collection counts.
    pub fn stats(&self) -> Result<FullTextStats> {
        let conn = self.conn.lock();
        let (rows, collections): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT collection) FROM fts_documents",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(FullTextStats {
            rows: rows as u64,
            collections: collections as u64,
        })
    }

    /// Flush pending WAL frames. Failures are logged, never propagated;
    /// the connection itself closes on drop.
    pub fn dispose(&self) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::warn!(error = %e, "full-text WAL checkpoint failed (ignored)");
        }
    }

    fn unranked_listing(&self, limit: usize, collection: Option<&str>) -> Result<Vec<FullTextHit>> {
        let conn = self.conn.lock();
        let sql = match collection {
            Some(_) => format!(
                "SELECT doc_id, collection, content, metadata FROM fts_documents
                 WHERE collection = ?1 ORDER BY rowid ASC LIMIT {limit}"
            ),
            None => format!(
                "SELECT doc_id, collection, content, metadata FROM fts_documents
                 ORDER BY rowid ASC LIMIT {limit}"
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let doc_id: String = row.get(0)?;
            let coll: String = row.get(1)?;
            let content: String = row.get(2)?;
            let metadata_text: String = row.get(3)?;
            Ok((doc_id, coll, content, metadata_text))
        };
        let rows: Vec<_> = match collection {
            Some(c) => stmt
                .query_map(params![c], map_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<_>>()?,
        };
        rows.into_iter()
            .map(|(doc_id, coll, content, metadata_text)| {
                Ok(FullTextHit {
                    doc_id,
                    collection: coll,
                    snippet: leading_tokens(&content, config::SNIPPET_TOKENS as usize),
                    score: 0.0,
                    metadata: parse_metadata(&metadata_text)?,
                })
            })
            .collect()
    }

    /// Build the FTS5 MATCH expression, or `None` for the unranked path.
    ///
    /// Every whitespace token becomes one quoted phrase. In CJK mode a
    /// token is segmented first, so a run like `知識管理` turns into the
    /// order-preserving phrase `"知 識 管 理"` rather than independent
    /// single-character terms.
    fn build_match_expr(&self, query: &str) -> Option<String> {
        let phrases: Vec<String> = query
            .split_whitespace()
            .filter(|token| !token.chars().all(|c| c == '*'))
            .map(|token| {
                let token = if self.config.cjk {
                    segment_cjk(token)
                } else {
                    token.to_string()
                };
                format!("\"{}\"", token.replace('"', "\"\""))
            })
            .collect();
        if phrases.is_empty() {
            return None;
        }
        Some(phrases.join(" "))
    }

    fn put_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO fts_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        use rusqlite::OptionalExtension;
        Ok(conn
            .query_row(
                "SELECT value FROM fts_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn parse_metadata(text: &str) -> Result<Value> {
    serde_json::from_str(text)
        .map_err(|e| Error::InvalidStoredValue(format!("metadata decode: {e}")))
}

fn decompose_key<'a>(doc_id: &'a str, collection: &'a str) -> (&'a str, &'a str) {
    if let Some(rest) = doc_id.strip_prefix(collection) {
        if let Some(bare) = rest.strip_prefix(':') {
            if !collection.is_empty() {
                return (collection, bare);
            }
        }
    }
    if collection.is_empty() && doc_id.contains(':') {
        return split_composite_key(doc_id);
    }
    (collection, doc_id)
}

/// True for codepoints segmented character-by-character in CJK mode.
fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF        // Hiragana, Katakana
        | 0x3400..=0x4DBF      // CJK Extension A
        | 0x4E00..=0x9FFF      // CJK Unified Ideographs
        | 0xF900..=0xFAFF      // CJK Compatibility Ideographs
        | 0xAC00..=0xD7AF      // Hangul Syllables
        | 0x20000..=0x2A6DF    // CJK Extension B
    )
}

/// Split runs of CJK codepoints into single-character tokens.
fn segment_cjk(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        if is_cjk(c) {
            if !out.ends_with(' ') && !out.is_empty() {
                out.push(' ');
            }
            out.push(c);
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out.trim_end().to_string()
}

/// First `n` whitespace tokens of `text`, with an ellipsis when truncated.
fn leading_tokens(text: &str, n: usize) -> String {
    let mut end = 0;
    let mut count = 0;
    for (i, token) in text.split_whitespace().enumerate() {
        if i >= n {
            break;
        }
        let start = token.as_ptr() as usize - text.as_ptr() as usize;
        end = start + token.len();
        count += 1;
    }
    if count == 0 {
        return String::new();
    }
    let truncated = &text[..end];
    if end < text.trim_end().len() {
        format!("{truncated}{}", config::SNIPPET_ELLIPSIS)
    } else {
        truncated.to_string()
    }
}
