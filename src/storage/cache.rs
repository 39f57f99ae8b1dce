//! Web fetch/search result cache
//!
//! Two key/value tables share the conversation database: fetched pages keyed
//! by URL and search results keyed by normalized query. Entries expire by
//! TTL, evaluated on every read. The cache is optional everywhere; every
//! failure degrades to a miss.

use super::retry::{with_busy_retry, RetryPolicy};
use super::{now_unix, Database};
use crate::config::CacheConfig;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;

/// Minimum number of query keywords that must appear in a cached result
const MIN_KEYWORD_MATCHES: usize = 3;

/// Minimum fraction of query keywords that must appear in a cached result
const MIN_MATCH_RATIO: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "how", "i", "in", "is", "it", "me", "my", "of", "on", "or", "that", "the", "this", "to",
    "was", "what", "when", "where", "which", "who", "why", "will", "with", "you", "your",
];

/// A cached result found by fuzzy lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
    /// URL or normalized query the result was stored under
    pub key: String,
    /// The cached result text
    pub result: String,
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Fetch,
    Search,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Fetch => "fetch_cache",
            Table::Search => "search_cache",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            Table::Fetch => "url",
            Table::Search => "query",
        }
    }
}

/// TTL-bounded cache over the shared database
#[derive(Debug)]
pub struct CacheStore {
    db: Database,
    retry: RetryPolicy,
    fetch_ttl: Duration,
    search_ttl: Duration,
}

impl CacheStore {
    /// Create a cache and sweep entries that already expired
    ///
    /// # Arguments
    ///
    /// * `db` - Shared database handle
    /// * `config` - TTLs for the two tables
    /// * `retry` - Busy-retry policy for writes
    pub fn new(db: Database, config: &CacheConfig, retry: RetryPolicy) -> Self {
        let store = Self {
            db,
            retry,
            fetch_ttl: Duration::from_secs(config.fetch_ttl_secs),
            search_ttl: Duration::from_secs(config.search_ttl_secs),
        };
        let pruned = store.prune_expired();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned expired cache entries at open");
        }
        store
    }

    fn ttl(&self, table: Table) -> Duration {
        match table {
            Table::Fetch => self.fetch_ttl,
            Table::Search => self.search_ttl,
        }
    }

    fn cutoff(&self, table: Table) -> i64 {
        let ttl = i64::try_from(self.ttl(table).as_secs()).unwrap_or(i64::MAX);
        now_unix().saturating_sub(ttl)
    }

    fn get(&self, table: Table, key: &str) -> Option<String> {
        let sql = format!(
            "SELECT result FROM {} WHERE {} = ?1 AND created > ?2",
            table.name(),
            table.key_column()
        );
        let cutoff = self.cutoff(table);
        match self.db.with_conn(|conn| {
            conn.query_row(&sql, params![key, cutoff], |row| row.get::<_, String>(0))
                .optional()
        }) {
            Ok(hit) => {
                tracing::trace!(table = table.name(), key, hit = hit.is_some(), "Cache lookup");
                hit
            }
            Err(e) => {
                tracing::debug!(table = table.name(), error = %e, "Cache lookup failed");
                None
            }
        }
    }

    fn put(&self, table: Table, key: &str, result: &str) {
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}, result, created) VALUES (?1, ?2, ?3)",
            table.name(),
            table.key_column()
        );
        let now = now_unix();
        let written = with_busy_retry(&self.retry, "cache_put", || {
            self.db
                .with_conn(|conn| conn.execute(&sql, params![key, result, now]))
        });
        if let Err(e) = written {
            tracing::warn!(table = table.name(), error = %e, "Failed to write cache entry");
        }
    }

    /// Cached result for `url`, if present and fresh
    pub fn get_fetch(&self, url: &str) -> Option<String> {
        self.get(Table::Fetch, url)
    }

    /// Store a fetched result under the verbatim `url`
    pub fn put_fetch(&self, url: &str, result: &str) {
        self.put(Table::Fetch, url, result);
    }

    /// Cached result for a search query, if present and fresh
    ///
    /// The query is lower-cased and trimmed before lookup.
    pub fn get_search(&self, query: &str) -> Option<String> {
        self.get(Table::Search, &normalize_query(query))
    }

    /// Store a search result under the normalized query
    pub fn put_search(&self, query: &str, result: &str) {
        self.put(Table::Search, &normalize_query(query), result);
    }

    /// Find a fresh cached result whose text covers most of `query`
    ///
    /// A result is a candidate when at least three query keywords occur in
    /// it and those make up at least 75% of all query keywords. Among
    /// candidates the one with the most matches wins, then the newest.
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel::config::CacheConfig;
    /// use kestrel::storage::{CacheStore, Database, RetryPolicy};
    ///
    /// let db = Database::open_in_memory().unwrap();
    /// let cache = CacheStore::new(db, &CacheConfig::default(), RetryPolicy::default());
    /// cache.put_fetch("https://example.com", "Rust async runtime tokio tutorial");
    /// assert!(cache.search_cached_content("tokio async runtime").is_some());
    /// assert!(cache.search_cached_content("python flask deployment").is_none());
    /// ```
    pub fn search_cached_content(&self, query: &str) -> Option<CachedContent> {
        let keywords = extract_keywords(query);
        if keywords.len() < MIN_KEYWORD_MATCHES {
            return None;
        }

        let mut best: Option<(usize, i64, CachedContent)> = None;
        for table in [Table::Fetch, Table::Search] {
            let rows = match self.fresh_rows(table) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::debug!(table = table.name(), error = %e, "Cache scan failed");
                    continue;
                }
            };

            for (key, result, created) in rows {
                let haystack = result.to_lowercase();
                let matched = keywords
                    .iter()
                    .filter(|k| haystack.contains(k.as_str()))
                    .count();
                if matched < MIN_KEYWORD_MATCHES
                    || (matched as f64) / (keywords.len() as f64) < MIN_MATCH_RATIO
                {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((m, c, _)) => matched > *m || (matched == *m && created > *c),
                };
                if better {
                    best = Some((matched, created, CachedContent { key, result }));
                }
            }
        }

        best.map(|(matched, _, content)| {
            tracing::debug!(key = %content.key, matched, "Fuzzy cache hit");
            content
        })
    }

    fn fresh_rows(&self, table: Table) -> rusqlite::Result<Vec<(String, String, i64)>> {
        let sql = format!(
            "SELECT {}, result, created FROM {} WHERE created > ?1",
            table.key_column(),
            table.name()
        );
        let cutoff = self.cutoff(table);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })
    }

    /// Delete expired entries from both tables, returning how many went
    pub fn prune_expired(&self) -> usize {
        let fetch_cutoff = self.cutoff(Table::Fetch);
        let search_cutoff = self.cutoff(Table::Search);
        let pruned = with_busy_retry(&self.retry, "cache_prune", || {
            self.db.with_conn(|conn| {
                let fetch =
                    conn.execute("DELETE FROM fetch_cache WHERE created <= ?1", [fetch_cutoff])?;
                let search = conn
                    .execute("DELETE FROM search_cache WHERE created <= ?1", [search_cutoff])?;
                Ok(fetch + search)
            })
        });
        match pruned {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to prune cache");
                0
            }
        }
    }

    /// Delete every entry, returning how many went
    pub fn clear(&self) -> usize {
        let cleared = with_busy_retry(&self.retry, "cache_clear", || {
            self.db.with_conn(|conn| {
                let fetch = conn.execute("DELETE FROM fetch_cache", [])?;
                let search = conn.execute("DELETE FROM search_cache", [])?;
                Ok(fetch + search)
            })
        });
        match cleared {
            Ok(count) => {
                tracing::info!(count, "Cleared cache");
                count
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to clear cache");
                0
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, secs: i64) {
        self.db
            .with_conn(|conn| {
                conn.execute("UPDATE fetch_cache SET created = created - ?1", [secs])?;
                conn.execute("UPDATE search_cache SET created = created - ?1", [secs])
            })
            .expect("backdate cache rows");
    }
}

/// Optional cache collaborator
///
/// A disabled handle answers every lookup with a miss and ignores writes,
/// so callers never branch on whether caching is configured.
#[derive(Debug, Clone, Default)]
pub struct CacheHandle(Option<Arc<CacheStore>>);

impl CacheHandle {
    /// Wrap a live cache
    pub fn new(store: CacheStore) -> Self {
        Self(Some(Arc::new(store)))
    }

    /// A handle that caches nothing
    pub fn disabled() -> Self {
        Self(None)
    }

    /// Whether a real cache backs this handle
    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    /// See [`CacheStore::get_fetch`]
    pub fn get_fetch(&self, url: &str) -> Option<String> {
        self.0.as_ref()?.get_fetch(url)
    }

    /// See [`CacheStore::put_fetch`]
    pub fn put_fetch(&self, url: &str, result: &str) {
        if let Some(store) = &self.0 {
            store.put_fetch(url, result);
        }
    }

    /// See [`CacheStore::get_search`]
    pub fn get_search(&self, query: &str) -> Option<String> {
        self.0.as_ref()?.get_search(query)
    }

    /// See [`CacheStore::put_search`]
    pub fn put_search(&self, query: &str, result: &str) {
        if let Some(store) = &self.0 {
            store.put_search(query, result);
        }
    }

    /// See [`CacheStore::search_cached_content`]
    pub fn search_cached_content(&self, query: &str) -> Option<CachedContent> {
        self.0.as_ref()?.search_cached_content(query)
    }

    /// See [`CacheStore::prune_expired`]
    pub fn prune_expired(&self) -> usize {
        self.0.as_ref().map_or(0, |s| s.prune_expired())
    }

    /// See [`CacheStore::clear`]
    pub fn clear(&self) -> usize {
        self.0.as_ref().map_or(0, |s| s.clear())
    }
}

/// Lower-case and trim a search query
pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

/// Significant lower-cased words of `text`, deduplicated, in order
///
/// Words split on anything that is not alphanumeric, `-` or `_`. Stopwords
/// and single characters are dropped.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut keywords: Vec<String> = Vec::new();
    for word in lowered.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_')) {
        let word = word.trim_matches(|c| c == '-' || c == '_');
        if word.chars().count() < 2 || STOPWORDS.contains(&word) {
            continue;
        }
        if !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
        }
    }
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRUSH: &str = "Charmbracelet Crush is a terminal-based AI coding agent. \
                         It is built with Bubbletea and Lip Gloss and runs in your shell.";

    fn create_test_cache() -> CacheStore {
        let db = Database::open_in_memory().expect("open");
        CacheStore::new(db, &CacheConfig::default(), RetryPolicy::default())
    }

    #[test]
    fn test_fetch_hit_returns_exact_value() {
        let cache = create_test_cache();
        cache.put_fetch("https://github.com/charmbracelet/crush", CRUSH);
        assert_eq!(
            cache.get_fetch("https://github.com/charmbracelet/crush"),
            Some(CRUSH.to_string())
        );
        assert_eq!(cache.get_fetch("https://github.com/charmbracelet"), None);
    }

    #[test]
    fn test_fetch_expires_after_ttl() {
        let cache = create_test_cache();
        cache.put_fetch("https://a.example", "body");
        cache.backdate(24 * 60 * 60 + 1);
        assert_eq!(cache.get_fetch("https://a.example"), None);
    }

    #[test]
    fn test_search_ttl_is_shorter_than_fetch_ttl() {
        let cache = create_test_cache();
        cache.put_fetch("https://a.example", "page");
        cache.put_search("rust", "results");
        cache.backdate(2 * 60 * 60);
        assert_eq!(cache.get_search("rust"), None);
        assert_eq!(cache.get_fetch("https://a.example"), Some("page".to_string()));
    }

    #[test]
    fn test_search_query_is_normalized() {
        let cache = create_test_cache();
        cache.put_search("  Rust Async  ", "tokio");
        assert_eq!(cache.get_search("rust async"), Some("tokio".to_string()));
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let cache = create_test_cache();
        cache.put_fetch("https://a.example", "old");
        cache.put_fetch("https://a.example", "new");
        assert_eq!(cache.get_fetch("https://a.example"), Some("new".to_string()));
    }

    #[test]
    fn test_fuzzy_match_hit_and_miss() {
        let cache = create_test_cache();
        cache.put_fetch("https://github.com/charmbracelet/crush", CRUSH);

        let hit = cache
            .search_cached_content("charmbracelet terminal agent")
            .expect("should hit");
        assert_eq!(hit.key, "https://github.com/charmbracelet/crush");
        assert_eq!(hit.result, CRUSH);

        assert!(cache.search_cached_content("python flask deployment").is_none());
    }

    #[test]
    fn test_fuzzy_match_requires_three_keywords() {
        let cache = create_test_cache();
        cache.put_fetch("https://x.example", CRUSH);
        assert!(cache.search_cached_content("charmbracelet crush").is_none());
    }

    #[test]
    fn test_fuzzy_match_requires_ratio() {
        let cache = create_test_cache();
        cache.put_fetch("https://x.example", CRUSH);
        // 3 of 5 keywords match: 60% is below the threshold
        assert!(cache
            .search_cached_content("charmbracelet terminal agent kubernetes helm")
            .is_none());
        // 3 of 4 match: exactly 75%
        assert!(cache
            .search_cached_content("charmbracelet terminal agent kubernetes")
            .is_some());
    }

    #[test]
    fn test_fuzzy_match_ignores_expired() {
        let cache = create_test_cache();
        cache.put_fetch("https://x.example", CRUSH);
        cache.backdate(48 * 60 * 60);
        assert!(cache
            .search_cached_content("charmbracelet terminal agent")
            .is_none());
    }

    #[test]
    fn test_fuzzy_match_prefers_more_matches() {
        let cache = create_test_cache();
        cache.put_fetch("https://weak.example", "charmbracelet terminal agent");
        cache.put_search("crush", CRUSH);
        let hit = cache
            .search_cached_content("charmbracelet terminal agent bubbletea")
            .expect("hit");
        assert_eq!(hit.key, "crush");
    }

    #[test]
    fn test_extract_keywords() {
        assert_eq!(
            extract_keywords("How does the terminal-based agent work? a b"),
            vec!["terminal-based", "agent", "work"]
        );
        assert_eq!(extract_keywords("Rust rust RUST"), vec!["rust"]);
        assert!(extract_keywords("the a of").is_empty());
    }

    #[test]
    fn test_prune_and_clear_counts() {
        let cache = create_test_cache();
        cache.put_fetch("https://a.example", "a");
        cache.put_search("q", "b");
        cache.backdate(2 * 60 * 60);
        cache.put_fetch("https://b.example", "c");

        assert_eq!(cache.prune_expired(), 1);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.get_fetch("https://a.example"), None);
    }

    #[test]
    fn test_disabled_handle_is_noop() {
        let handle = CacheHandle::disabled();
        assert!(!handle.is_enabled());
        handle.put_fetch("https://a.example", "a");
        assert_eq!(handle.get_fetch("https://a.example"), None);
        assert!(handle.search_cached_content("a b c").is_none());
        assert_eq!(handle.clear(), 0);
    }

    #[test]
    fn test_handle_delegates() {
        let handle = CacheHandle::new(create_test_cache());
        let clone = handle.clone();
        handle.put_search("Rust", "r");
        assert_eq!(clone.get_search("rust"), Some("r".to_string()));
    }
}
