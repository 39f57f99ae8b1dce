mod common;

use kestrel::config::{CacheConfig, StorageConfig};
use kestrel::storage::{CacheHandle, CacheStore, Database, RetryPolicy};
use tempfile::TempDir;

const CRUSH_README: &str = "Crush: your new coding bestie, now available in your favourite \
    terminal. Charmbracelet Crush is a terminal-based AI coding agent that connects your tools, \
    code and workflows to the LLM of your choice. Built with Bubbletea.";

fn open(dir: &TempDir, cache: &CacheConfig) -> (Database, CacheStore) {
    let config = StorageConfig {
        db_path: dir.path().join("kestrel.db"),
        ..StorageConfig::default()
    };
    let db = Database::open(&config.db_path, &config).unwrap();
    let store = CacheStore::new(db.clone(), cache, RetryPolicy::default());
    (db, store)
}

fn backdate(db: &Database, secs: i64) {
    db.with_conn(|conn| {
        conn.execute("UPDATE fetch_cache SET created = created - ?1", [secs])?;
        conn.execute("UPDATE search_cache SET created = created - ?1", [secs])
    })
    .unwrap();
}

#[test]
fn test_entry_is_hit_before_ttl_and_miss_after() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        fetch_ttl_secs: 600,
        search_ttl_secs: 60,
        ..CacheConfig::default()
    };
    let (db, cache) = open(&dir, &config);

    cache.put_fetch("https://charm.sh/crush", CRUSH_README);
    cache.put_search("Crush Agent", "search results");

    backdate(&db, 30);
    assert_eq!(
        cache.get_fetch("https://charm.sh/crush").as_deref(),
        Some(CRUSH_README)
    );
    assert_eq!(
        cache.get_search("crush agent").as_deref(),
        Some("search results")
    );

    backdate(&db, 60);
    assert_eq!(cache.get_search("crush agent"), None);
    assert!(cache.get_fetch("https://charm.sh/crush").is_some());

    backdate(&db, 600);
    assert_eq!(cache.get_fetch("https://charm.sh/crush"), None);
}

#[test]
fn test_expired_rows_are_swept_on_open() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig::default();
    {
        let (db, cache) = open(&dir, &config);
        cache.put_fetch("https://old.example", "stale");
        cache.put_fetch("https://new.example", "fresh");
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE fetch_cache SET created = created - 100000 WHERE url = 'https://old.example'",
                [],
            )
        })
        .unwrap();
    }

    let (db, cache) = open(&dir, &config);
    let rows: i64 = db
        .with_conn(|conn| conn.query_row("SELECT count(*) FROM fetch_cache", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(cache.get_fetch("https://new.example").as_deref(), Some("fresh"));
}

#[test]
fn test_fuzzy_lookup_over_persisted_results() {
    let dir = TempDir::new().unwrap();
    let (_db, cache) = open(&dir, &CacheConfig::default());
    let handle = CacheHandle::new(cache);
    handle.put_fetch("https://github.com/charmbracelet/crush", CRUSH_README);
    handle.put_search("rust sqlite wal", "WAL mode lets readers proceed during writes");

    let hit = handle
        .search_cached_content("charmbracelet terminal agent")
        .expect("expected a fuzzy hit");
    assert_eq!(hit.key, "https://github.com/charmbracelet/crush");
    assert_eq!(hit.result, CRUSH_README);

    assert!(handle.search_cached_content("python flask deployment").is_none());
    // only two significant keywords
    assert!(handle.search_cached_content("the charmbracelet agent").is_none());
}

#[test]
fn test_disabled_handle_never_hits() {
    let handle = CacheHandle::disabled();
    handle.put_search("anything", "value");
    assert_eq!(handle.get_search("anything"), None);
    assert_eq!(handle.prune_expired(), 0);
}
