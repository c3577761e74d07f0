use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;

const DB_DIR: &str = "data";
const DB_PATH: &str = "data/sync.sqlite";

pub fn connect() -> Result<Connection> {
    std::fs::create_dir_all(DB_DIR)?;
    let conn = Connection::open(DB_PATH)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_runs (
            id          INTEGER PRIMARY KEY,
            started_at  TEXT NOT NULL,
            finished_at TEXT,
            dry_run     BOOLEAN NOT NULL DEFAULT 0,
            pages       INTEGER NOT NULL DEFAULT 0,
            ok          INTEGER NOT NULL DEFAULT 0,
            errors      INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS page_syncs (
            id             INTEGER PRIMARY KEY,
            run_id         INTEGER NOT NULL REFERENCES sync_runs(id),
            page_id        TEXT NOT NULL,
            title          TEXT,
            config_path    TEXT NOT NULL,
            merge_path     TEXT,
            version_before INTEGER,
            version_after  INTEGER,
            changed        BOOLEAN NOT NULL DEFAULT 0,
            error          TEXT,
            synced_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_page_syncs_page ON page_syncs(page_id);
        CREATE INDEX IF NOT EXISTS idx_page_syncs_run ON page_syncs(run_id);
        ",
    )?;
    Ok(())
}

// ── Runs ──

pub fn start_run(conn: &Connection, dry_run: bool) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_runs (started_at, dry_run) VALUES (?1, ?2)",
        rusqlite::params![Utc::now().to_rfc3339(), dry_run],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_run(conn: &Connection, run_id: i64, pages: usize, ok: usize, errors: usize) -> Result<()> {
    conn.execute(
        "UPDATE sync_runs SET finished_at = ?1, pages = ?2, ok = ?3, errors = ?4 WHERE id = ?5",
        rusqlite::params![Utc::now().to_rfc3339(), pages as i64, ok as i64, errors as i64, run_id],
    )?;
    Ok(())
}

// ── Page syncs ──

pub struct PageSyncRow {
    pub run_id: i64,
    pub page_id: String,
    pub title: Option<String>,
    pub config_path: String,
    pub merge_path: Option<String>,
    pub version_before: Option<u64>,
    pub version_after: Option<u64>,
    pub changed: bool,
    pub error: Option<String>,
}

pub fn record_page_sync(conn: &Connection, row: &PageSyncRow) -> Result<()> {
    conn.execute(
        "INSERT INTO page_syncs
         (run_id, page_id, title, config_path, merge_path, version_before, version_after, changed, error, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            row.run_id,
            row.page_id,
            row.title,
            row.config_path,
            row.merge_path,
            row.version_before.map(|v| v as i64),
            row.version_after.map(|v| v as i64),
            row.changed,
            row.error,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub struct HistoryRow {
    pub run_id: i64,
    pub page_id: String,
    pub title: String,
    pub merge_path: String,
    pub version_before: Option<i64>,
    pub version_after: Option<i64>,
    pub changed: bool,
    pub error: Option<String>,
    pub synced_at: String,
}

pub fn fetch_history(conn: &Connection, page_id: Option<&str>, limit: usize) -> Result<Vec<HistoryRow>> {
    let sql = format!(
        "SELECT run_id, page_id, COALESCE(title,''), COALESCE(merge_path,'-'),
                version_before, version_after, changed, error, synced_at
         FROM page_syncs{}
         ORDER BY id DESC
         LIMIT {}",
        if page_id.is_some() { " WHERE page_id = ?1" } else { "" },
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<HistoryRow> {
        Ok(HistoryRow {
            run_id: row.get(0)?,
            page_id: row.get(1)?,
            title: row.get(2)?,
            merge_path: row.get(3)?,
            version_before: row.get(4)?,
            version_after: row.get(5)?,
            changed: row.get(6)?,
            error: row.get(7)?,
            synced_at: row.get(8)?,
        })
    };
    let rows = match page_id {
        Some(id) => stmt.query_map([id], map)?.collect::<Result<Vec<_>, _>>()?,
        None => stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub runs: usize,
    pub page_syncs: usize,
    pub changed: usize,
    pub errors: usize,
    pub appended: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM sync_runs", [], |r| r.get(0))?;
    let page_syncs: usize = conn.query_row("SELECT COUNT(*) FROM page_syncs", [], |r| r.get(0))?;
    let changed: usize =
        conn.query_row("SELECT COUNT(*) FROM page_syncs WHERE changed = 1", [], |r| r.get(0))?;
    let errors: usize = conn.query_row(
        "SELECT COUNT(*) FROM page_syncs WHERE error IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    // Repeated appends on one page usually mean the host is stripping every marker.
    let appended: usize = conn.query_row(
        "SELECT COUNT(*) FROM page_syncs WHERE merge_path = 'appended'",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        runs,
        page_syncs,
        changed,
        errors,
        appended,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn row(run_id: i64, page_id: &str, merge_path: &str, error: Option<&str>) -> PageSyncRow {
        PageSyncRow {
            run_id,
            page_id: page_id.to_string(),
            title: Some(format!("Page {}", page_id)),
            config_path: format!("pages/{}.yaml", page_id),
            merge_path: Some(merge_path.to_string()),
            version_before: Some(3),
            version_after: error.is_none().then_some(4),
            changed: error.is_none(),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = memory_db();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn records_and_reads_history() {
        let conn = memory_db();
        let run = start_run(&conn, false).unwrap();
        record_page_sync(&conn, &row(run, "100", "container:attribute", None)).unwrap();
        record_page_sync(&conn, &row(run, "200", "appended", None)).unwrap();
        record_page_sync(&conn, &row(run, "100", "container:attribute", Some("409"))).unwrap();
        finish_run(&conn, run, 3, 2, 1).unwrap();

        let all = fetch_history(&conn, None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].error.as_deref(), Some("409"));
        assert_eq!(all[0].version_after, None);

        let page = fetch_history(&conn, Some("100"), 10).unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|r| r.page_id == "100"));
        assert_eq!(page[1].version_before, Some(3));
        assert!(page[1].changed);

        let limited = fetch_history(&conn, None, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn stats_count_outcomes() {
        let conn = memory_db();
        let run = start_run(&conn, true).unwrap();
        record_page_sync(&conn, &row(run, "1", "appended", None)).unwrap();
        record_page_sync(&conn, &row(run, "2", "legacy_migration", None)).unwrap();
        record_page_sync(&conn, &row(run, "3", "container:class", Some("boom"))).unwrap();
        let s = get_stats(&conn).unwrap();
        assert_eq!(s.runs, 1);
        assert_eq!(s.page_syncs, 3);
        assert_eq!(s.changed, 2);
        assert_eq!(s.errors, 1);
        assert_eq!(s.appended, 1);
    }
}
