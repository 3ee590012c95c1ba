//! The SQLite-backed index.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::DateTime;
use corestash_common::{Coredump, Language};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::query::{self, SqlValue};
use super::{Index, IndexError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS coredumps (
    uid               TEXT PRIMARY KEY,
    dumped_at         INTEGER NOT NULL,
    hostname          TEXT NOT NULL,
    executable        TEXT NOT NULL,
    executable_path   TEXT NOT NULL,
    executable_hash   TEXT NOT NULL,
    executable_size   INTEGER NOT NULL,
    size              INTEGER NOT NULL,
    lang              TEXT,
    trace             TEXT,
    analyzed          INTEGER NOT NULL DEFAULT 0,
    analyzed_at       INTEGER,
    forwarder_version TEXT NOT NULL,
    indexer_version   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS coredumps_dumped_at ON coredumps (dumped_at);
CREATE INDEX IF NOT EXISTS coredumps_executable_hash ON coredumps (executable_hash);
CREATE INDEX IF NOT EXISTS coredumps_analyzed ON coredumps (analyzed);
CREATE TABLE IF NOT EXISTS coredump_meta (
    uid   TEXT NOT NULL,
    key   TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (uid, key)
);
CREATE INDEX IF NOT EXISTS coredump_meta_uid ON coredump_meta (uid);
";

const COLUMNS: &str = "uid, dumped_at, hostname, executable, executable_path, \
    executable_hash, executable_size, size, lang, trace, analyzed, analyzed_at, \
    forwarder_version, indexer_version";

/// Index storing documents in a single SQLite database under the index
/// directory.
///
/// Timestamps are stored as unix milliseconds so range clauses and sorting
/// are plain integer comparisons. The metadata map is flattened into the
/// `coredump_meta` table, one row per `meta.<key>` field.
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl SqliteIndex {
    /// Opens (or creates) the index stored in `dir`.
    pub fn open(dir: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(dir).map_err(IndexError::backend)?;
        let conn = Connection::open(dir.join("index.sqlite"))?;
        // Another process (or a restart racing the old one) may hold the
        // database briefly; wait instead of surfacing SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteIndex {
            conn: Mutex::new(conn),
        })
    }
}

impl Index for SqliteIndex {
    fn index(&self, core: &Coredump) -> Result<(), IndexError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO coredumps (uid, dumped_at, hostname, executable, \
             executable_path, executable_hash, executable_size, size, lang, trace, \
             analyzed, analyzed_at, forwarder_version, indexer_version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                core.uid,
                core.dumped_at.timestamp_millis(),
                core.hostname,
                core.executable,
                core.executable_path,
                core.executable_hash,
                core.executable_size as i64,
                core.size as i64,
                core.lang.map(Language::as_str),
                core.trace,
                core.analyzed,
                core.analyzed_at.map(|t| t.timestamp_millis()),
                core.forwarder_version,
                core.indexer_version,
            ],
        )?;

        tx.execute(
            "DELETE FROM coredump_meta WHERE uid = ?1",
            params![core.uid],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO coredump_meta (uid, key, value) VALUES (?1, ?2, ?3)",
            )?;
            for (key, value) in &core.metadata {
                stmt.execute(params![core.uid, key, value])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn find(&self, uid: &str) -> Result<Coredump, IndexError> {
        let conn = self.conn.lock().unwrap();

        let sql = format!("SELECT {COLUMNS} FROM coredumps WHERE uid = ?1");
        let row = conn
            .prepare(&sql)?
            .query_row(params![uid], read_row)
            .optional()?
            .ok_or(IndexError::NotFound)?;

        let mut core = into_core(row)?;
        core.metadata = metadata_for(&conn, &core.uid)?;
        Ok(core)
    }

    fn delete(&self, uid: &str) -> Result<(), IndexError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM coredump_meta WHERE uid = ?1", params![uid])?;
        tx.execute("DELETE FROM coredumps WHERE uid = ?1", params![uid])?;
        tx.commit()?;
        Ok(())
    }

    fn search(
        &self,
        query: &str,
        sort: &str,
        size: usize,
        from: usize,
    ) -> Result<(Vec<Coredump>, u64), IndexError> {
        let compiled = query::compile(query)?;
        let (column, descending) = parse_sort(sort)?;

        let conn = self.conn.lock().unwrap();

        let values: Vec<Value> = compiled.params.into_iter().map(Value::from).collect();

        let count_sql = format!("SELECT COUNT(*) FROM coredumps WHERE {}", compiled.sql);
        let total: i64 = conn.query_row(
            &count_sql,
            params_from_iter(values.iter().cloned()),
            |row| row.get(0),
        )?;

        let direction = if descending { "DESC" } else { "ASC" };
        let page_sql = format!(
            "SELECT {COLUMNS} FROM coredumps WHERE {} \
             ORDER BY {column} {direction}, uid {direction} LIMIT ? OFFSET ?",
            compiled.sql
        );
        let mut page_values = values;
        page_values.push(Value::Integer(size as i64));
        page_values.push(Value::Integer(from as i64));

        let rows: Vec<Row> = conn
            .prepare(&page_sql)?
            .query_map(params_from_iter(page_values), read_row)?
            .collect::<rusqlite::Result<_>>()?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let mut core = into_core(row)?;
            core.metadata = metadata_for(&conn, &core.uid)?;
            results.push(core);
        }

        Ok((results, total as u64))
    }
}

fn parse_sort(sort: &str) -> Result<(&'static str, bool), IndexError> {
    let (field, descending) = match sort.strip_prefix('-') {
        Some(field) => (field, true),
        None => (sort, false),
    };
    match field {
        "dumped_at" => Ok(("dumped_at", descending)),
        "hostname" => Ok(("hostname", descending)),
        _ => Err(IndexError::Query(format!("invalid sort field {field:?}"))),
    }
}

impl From<SqlValue> for Value {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Text(s) => Value::Text(s),
            SqlValue::Int(i) => Value::Integer(i),
        }
    }
}

/// The typed columns of one result row, before document conversion.
struct Row {
    uid: String,
    dumped_at: i64,
    hostname: String,
    executable: String,
    executable_path: String,
    executable_hash: String,
    executable_size: i64,
    size: i64,
    lang: Option<String>,
    trace: Option<String>,
    analyzed: bool,
    analyzed_at: Option<i64>,
    forwarder_version: String,
    indexer_version: String,
}

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<Row> {
    Ok(Row {
        uid: row.get(0)?,
        dumped_at: row.get(1)?,
        hostname: row.get(2)?,
        executable: row.get(3)?,
        executable_path: row.get(4)?,
        executable_hash: row.get(5)?,
        executable_size: row.get(6)?,
        size: row.get(7)?,
        lang: row.get(8)?,
        trace: row.get(9)?,
        analyzed: row.get(10)?,
        analyzed_at: row.get(11)?,
        forwarder_version: row.get(12)?,
        indexer_version: row.get(13)?,
    })
}

fn into_core(row: Row) -> Result<Coredump, IndexError> {
    let lang = match row.lang.as_deref() {
        None => None,
        Some("c") => Some(Language::C),
        Some("go") => Some(Language::Go),
        Some(other) => {
            return Err(IndexError::Schema(format!("unknown language {other:?}")));
        }
    };

    Ok(Coredump {
        dumped_at: timestamp(row.dumped_at)?,
        analyzed_at: row.analyzed_at.map(timestamp).transpose()?,
        uid: row.uid,
        hostname: row.hostname,
        executable: row.executable,
        executable_path: row.executable_path,
        executable_hash: row.executable_hash,
        executable_size: row.executable_size as u64,
        size: row.size as u64,
        lang,
        trace: row.trace,
        analyzed: row.analyzed,
        metadata: BTreeMap::new(),
        forwarder_version: row.forwarder_version,
        indexer_version: row.indexer_version,
    })
}

fn timestamp(millis: i64) -> Result<chrono::DateTime<chrono::Utc>, IndexError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| IndexError::Schema(format!("timestamp {millis} out of range")))
}

fn metadata_for(
    conn: &Connection,
    uid: &str,
) -> Result<BTreeMap<String, String>, IndexError> {
    let mut stmt = conn.prepare("SELECT key, value FROM coredump_meta WHERE uid = ?1")?;
    let mut rows = stmt.query(params![uid])?;

    let mut metadata = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let key: Value = row.get(0)?;
        let value: Value = row.get(1)?;
        match (key, value) {
            (Value::Text(key), Value::Text(value)) => {
                metadata.insert(key, value);
            }
            (key, value) => {
                return Err(IndexError::Schema(format!(
                    "metadata entry {key:?} => {value:?} is not a string pair"
                )));
            }
        }
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> (tempfile::TempDir, SqliteIndex) {
        let tmp = tempfile::tempdir().unwrap();
        let index = SqliteIndex::open(&tmp.path().join("index")).unwrap();
        (tmp, index)
    }

    fn core(uid: &str, dumped_at: &str, hostname: &str) -> Coredump {
        Coredump {
            uid: uid.to_owned(),
            dumped_at: dumped_at.parse().unwrap(),
            hostname: hostname.to_owned(),
            executable: "x".to_owned(),
            executable_path: "/bin/x".to_owned(),
            executable_hash: "aa".to_owned(),
            executable_size: 4,
            size: 5,
            lang: None,
            trace: None,
            analyzed: false,
            analyzed_at: None,
            metadata: BTreeMap::new(),
            forwarder_version: "0.1.0".to_owned(),
            indexer_version: "0.3.0".to_owned(),
        }
    }

    #[test]
    fn find_returns_what_was_indexed() {
        let (_tmp, index) = index();
        let mut c = core("u1", "2020-05-01T10:00:00Z", "h1");
        c.metadata.insert("service".to_owned(), "payments".to_owned());
        index.index(&c).unwrap();

        let found = index.find("u1").unwrap();
        assert_eq!(found.hostname, "h1");
        assert_eq!(found.dumped_at, c.dumped_at);
        assert_eq!(found.metadata.get("service").unwrap(), "payments");

        assert!(index.find("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn indexing_twice_is_an_upsert() {
        let (_tmp, index) = index();
        let mut c = core("u1", "2020-05-01T10:00:00Z", "h1");
        index.index(&c).unwrap();

        c.analyzed = true;
        c.trace = Some("trace".to_owned());
        c.lang = Some(Language::Go);
        c.metadata.insert("k".to_owned(), "v".to_owned());
        index.index(&c).unwrap();

        let (results, total) = index.search("*", "dumped_at", 10, 0).unwrap();
        assert_eq!(total, 1);
        assert!(results[0].analyzed);
        assert_eq!(results[0].lang, Some(Language::Go));
        assert_eq!(results[0].metadata.get("k").unwrap(), "v");
    }

    #[test]
    fn star_matches_everything_and_sorts() {
        let (_tmp, index) = index();
        index.index(&core("u1", "2020-05-01T10:00:00Z", "h2")).unwrap();
        index.index(&core("u2", "2020-05-02T10:00:00Z", "h1")).unwrap();
        index.index(&core("u3", "2020-05-03T10:00:00Z", "h3")).unwrap();

        let (results, total) = index.search("*", "-dumped_at", 10, 0).unwrap();
        assert_eq!(total, 3);
        let uids: Vec<_> = results.iter().map(|c| c.uid.as_str()).collect();
        assert_eq!(uids, vec!["u3", "u2", "u1"]);

        let (results, _) = index.search("*", "hostname", 10, 0).unwrap();
        let hosts: Vec<_> = results.iter().map(|c| c.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn size_zero_returns_only_the_total() {
        let (_tmp, index) = index();
        index.index(&core("u1", "2020-05-01T10:00:00Z", "h1")).unwrap();
        index.index(&core("u2", "2020-05-02T10:00:00Z", "h1")).unwrap();

        let (results, total) = index.search("*", "dumped_at", 0, 0).unwrap();
        assert!(results.is_empty());
        assert_eq!(total, 2);
    }

    #[test]
    fn pagination_walks_the_result_set() {
        let (_tmp, index) = index();
        for i in 1..=5 {
            index
                .index(&core(
                    &format!("u{i}"),
                    &format!("2020-05-0{i}T10:00:00Z"),
                    "h1",
                ))
                .unwrap();
        }

        let (page, total) = index.search("*", "dumped_at", 2, 2).unwrap();
        assert_eq!(total, 5);
        let uids: Vec<_> = page.iter().map(|c| c.uid.as_str()).collect();
        assert_eq!(uids, vec!["u3", "u4"]);
    }

    #[test]
    fn field_and_meta_clauses() {
        let (_tmp, index) = index();
        let mut a = core("u1", "2020-05-01T10:00:00Z", "h1");
        a.metadata.insert("service".to_owned(), "s".to_owned());
        index.index(&a).unwrap();
        index.index(&core("u2", "2020-05-02T10:00:00Z", "h2")).unwrap();

        let (_, total) = index.search("hostname:h1", "dumped_at", 10, 0).unwrap();
        assert_eq!(total, 1);

        let (_, total) = index.search("meta.service:s", "dumped_at", 10, 0).unwrap();
        assert_eq!(total, 1);

        let (_, total) = index
            .search("meta.service:missing", "dumped_at", 10, 0)
            .unwrap();
        assert_eq!(total, 0);

        // Reclamation query shape.
        let (_, total) = index
            .search("executable_hash:\"aa\"", "dumped_at", 0, 0)
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn unanalyzed_wildcard_query() {
        let (_tmp, index) = index();
        let mut done = core("u1", "2020-05-01T10:00:00Z", "h1");
        done.analyzed = true;
        done.analyzed_at = Some("2020-05-01T11:00:00Z".parse().unwrap());
        index.index(&done).unwrap();
        index.index(&core("u2", "2020-05-02T10:00:00Z", "h1")).unwrap();

        let (results, total) = index.search("analyzed:F*", "dumped_at", 10, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(results[0].uid, "u2");

        let (_, total) = index.search("analyzed:true", "dumped_at", 10, 0).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn dumped_at_range_clause() {
        let (_tmp, index) = index();
        index.index(&core("u1", "2020-05-01T10:00:00Z", "h1")).unwrap();
        index.index(&core("u2", "2020-06-01T10:00:00Z", "h1")).unwrap();

        let (results, total) = index
            .search("dumped_at:<\"2020-05-15T00:00:00Z\"", "dumped_at", 10, 0)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(results[0].uid, "u1");
    }

    #[test]
    fn barewords_match_text_and_metadata() {
        let (_tmp, index) = index();
        let mut c = core("u1", "2020-05-01T10:00:00Z", "web-42");
        c.trace = Some("panic: out of memory".to_owned());
        c.metadata.insert("team".to_owned(), "storage".to_owned());
        index.index(&c).unwrap();

        for q in ["panic", "web-42", "storage", "MEMORY"] {
            let (_, total) = index.search(q, "dumped_at", 10, 0).unwrap();
            assert_eq!(total, 1, "query {q:?}");
        }

        let (_, total) = index.search("unrelated", "dumped_at", 10, 0).unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn unknown_fields_are_empty_not_errors() {
        let (_tmp, index) = index();
        index.index(&core("u1", "2020-05-01T10:00:00Z", "h1")).unwrap();

        let (results, total) = index.search("bogus:value", "dumped_at", 10, 0).unwrap();
        assert!(results.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn negated_clause() {
        let (_tmp, index) = index();
        index.index(&core("u1", "2020-05-01T10:00:00Z", "h1")).unwrap();
        index.index(&core("u2", "2020-05-02T10:00:00Z", "h2")).unwrap();

        let (results, total) = index.search("-hostname:h1", "dumped_at", 10, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(results[0].uid, "u2");
    }

    #[test]
    fn delete_is_idempotent() {
        let (_tmp, index) = index();
        index.index(&core("u1", "2020-05-01T10:00:00Z", "h1")).unwrap();

        index.delete("u1").unwrap();
        assert!(index.find("u1").unwrap_err().is_not_found());
        index.delete("u1").unwrap();
    }

    #[test]
    fn invalid_sort_field_is_rejected() {
        let (_tmp, index) = index();
        assert!(matches!(
            index.search("*", "trace", 10, 0),
            Err(IndexError::Query(_))
        ));
    }

    #[test]
    fn search_by_uid_equals_find() {
        let (_tmp, index) = index();
        let mut c = core("u1", "2020-05-01T10:00:00Z", "h1");
        c.metadata.insert("k".to_owned(), "v".to_owned());
        index.index(&c).unwrap();

        let (results, _) = index.search("uid:\"u1\"", "dumped_at", 1, 0).unwrap();
        let found = index.find("u1").unwrap();
        assert_eq!(
            serde_json::to_value(&results[0]).unwrap(),
            serde_json::to_value(&found).unwrap()
        );
    }
}
