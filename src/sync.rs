use std::fmt;
use std::time::Instant;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::PageEntry;
use crate::confluence::ConfluenceClient;
use crate::db::{self, PageSyncRow};
use crate::notes::{self, SetupKind};
use crate::region::{self, MergePath, OnMissing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePath {
    Merge(MergePath),
    FirstRun(SetupKind),
}

impl fmt::Display for UpdatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePath::Merge(p) => write!(f, "{}", p),
            UpdatePath::FirstRun(k) => write!(f, "first_run:{}", k),
        }
    }
}

pub struct PlannedUpdate {
    pub html: String,
    pub path: UpdatePath,
}

/// Decide how the fragment lands on the page: merge into an existing (or
/// legacy) region, or lay out a Notes section first when the page asks for one.
pub fn plan_page_update(
    existing_html: &str,
    inner_html: &str,
    on_missing: OnMissing,
    notes_section: bool,
) -> PlannedUpdate {
    if notes_section
        && !region::has_managed_block(existing_html)
        && !region::has_legacy_block(existing_html)
    {
        let run = notes::first_run_setup(existing_html, inner_html);
        return PlannedUpdate {
            html: run.html,
            path: UpdatePath::FirstRun(run.kind),
        };
    }

    let outcome = region::merge(existing_html, inner_html, on_missing);
    PlannedUpdate {
        html: outcome.html,
        path: UpdatePath::Merge(outcome.path),
    }
}

pub struct PageReport {
    pub path: UpdatePath,
    pub version_before: u64,
    pub version_after: Option<u64>,
    pub changed: bool,
}

/// Fetch → merge → write `version + 1` for one page.
pub async fn sync_page(client: &ConfluenceClient, entry: &PageEntry, dry_run: bool) -> Result<PageReport> {
    let cfg = &entry.config;
    let fragment = entry.load_fragment()?;
    let page = client.fetch_page(&cfg.page_id).await?;

    let planned = plan_page_update(&page.body, &fragment, cfg.on_missing, cfg.notes_section);
    let changed = planned.html != page.body;
    info!("{}: {} at version {}", cfg.label(), planned.path, page.version);

    if !changed || dry_run {
        if !changed {
            info!("{}: page already up to date, skipping write", cfg.label());
        }
        return Ok(PageReport {
            path: planned.path,
            version_before: page.version,
            version_after: None,
            changed,
        });
    }

    let version = client.update_page(&page, &planned.html).await?;
    info!("{}: wrote version {}", cfg.label(), version);
    Ok(PageReport {
        path: planned.path,
        version_before: page.version,
        version_after: Some(version),
        changed,
    })
}

pub struct SyncStats {
    pub total: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
}

/// Sync pages one at a time. A failing page is logged and recorded; the run
/// moves on to the next one.
pub async fn sync_pages(
    conn: &Connection,
    client: &ConfluenceClient,
    entries: &[PageEntry],
    dry_run: bool,
) -> Result<SyncStats> {
    let pb = ProgressBar::new(entries.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    let run_id = db::start_run(conn, dry_run)?;
    let mut stats = SyncStats {
        total: entries.len(),
        updated: 0,
        unchanged: 0,
        errors: 0,
    };

    for entry in entries {
        let label = entry.config.label().to_string();
        pb.set_message(label.clone());
        let started = Instant::now();

        let row = match sync_page(client, entry, dry_run).await {
            Ok(report) => {
                if report.changed {
                    stats.updated += 1;
                } else {
                    stats.unchanged += 1;
                }
                PageSyncRow {
                    run_id,
                    page_id: entry.config.page_id.clone(),
                    title: entry.config.title.clone(),
                    config_path: entry.path.display().to_string(),
                    merge_path: Some(report.path.to_string()),
                    version_before: Some(report.version_before),
                    version_after: report.version_after,
                    changed: report.changed,
                    error: None,
                }
            }
            Err(e) => {
                stats.errors += 1;
                warn!("{}: sync failed after {:.1}s: {:#}", label, started.elapsed().as_secs_f64(), e);
                PageSyncRow {
                    run_id,
                    page_id: entry.config.page_id.clone(),
                    title: entry.config.title.clone(),
                    config_path: entry.path.display().to_string(),
                    merge_path: None,
                    version_before: None,
                    version_after: None,
                    changed: false,
                    error: Some(format!("{:#}", e)),
                }
            }
        };

        db::record_page_sync(conn, &row)?;
        pb.inc(1);
    }

    pb.finish_and_clear();
    db::finish_run(conn, run_id, stats.total, stats.total - stats.errors, stats.errors)?;
    info!(
        "Synced {} pages ({} updated, {} unchanged, {} errors)",
        stats.total, stats.updated, stats.unchanged, stats.errors
    );
    Ok(stats)
}
