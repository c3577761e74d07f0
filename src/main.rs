use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use qa_wiki_sync::config::{self, PageEntry};
use qa_wiki_sync::confluence::{ConfluenceClient, WikiConfig};
use qa_wiki_sync::region::{self, Marker, OnMissing};
use qa_wiki_sync::{db, sync};

#[derive(Parser)]
#[command(name = "qa_wiki_sync", about = "Keep generated QA tables in sync on Confluence pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge fresh fragments into every configured page
    Sync {
        /// Directory holding one YAML file per page
        #[arg(short, long, default_value = "pages")]
        dir: PathBuf,
        /// Only sync this page id
        #[arg(short, long)]
        page: Option<String>,
        /// Compute merges but never write to Confluence
        #[arg(long)]
        dry_run: bool,
    },
    /// Merge a fragment into a local page body (offline)
    Merge {
        /// Existing page body (storage format)
        page: PathBuf,
        /// Generated fragment to place in the managed region
        fragment: PathBuf,
        /// What to do when the page has no managed region
        #[arg(long, value_enum)]
        on_missing: OnMissing,
        /// Lay out a Notes section first on pages without a region
        #[arg(long)]
        notes: bool,
        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Report which marker identifies the managed region of a local page
    Detect {
        /// Page body (storage format)
        page: PathBuf,
    },
    /// Recent page syncs from the local ledger
    History {
        /// Filter by page id
        #[arg(short, long)]
        page: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Show sync statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sync { dir, page, dry_run } => {
            let entries: Vec<PageEntry> = config::load_page_configs(&dir)?
                .into_iter()
                .filter(|e| page.as_deref().map_or(true, |id| e.config.page_id == id))
                .collect();
            if entries.is_empty() {
                println!("No page configs matched in {}.", dir.display());
                return Ok(());
            }

            let client = ConfluenceClient::new(WikiConfig::from_env()?)?;
            let conn = db::connect()?;
            db::init_schema(&conn)?;

            println!(
                "Syncing {} pages{}...",
                entries.len(),
                if dry_run { " (dry run)" } else { "" }
            );
            let stats = sync::sync_pages(&conn, &client, &entries, dry_run).await?;
            println!(
                "Done: {} pages ({} {}, {} unchanged, {} errors).",
                stats.total,
                stats.updated,
                if dry_run { "would change" } else { "updated" },
                stats.unchanged,
                stats.errors
            );
            Ok(())
        }
        Commands::Merge {
            page,
            fragment,
            on_missing,
            notes,
            output,
        } => {
            let existing = fs::read_to_string(&page)
                .with_context(|| format!("Failed to read {}", page.display()))?;
            let inner = fs::read_to_string(&fragment)
                .with_context(|| format!("Failed to read {}", fragment.display()))?;

            let planned = sync::plan_page_update(&existing, &inner, on_missing, notes);
            eprintln!("Merge path: {}", planned.path);
            match output {
                Some(out) => {
                    fs::write(&out, &planned.html)
                        .with_context(|| format!("Failed to write {}", out.display()))?;
                    eprintln!("Wrote {} bytes to {}", planned.html.len(), out.display());
                }
                None => println!("{}", planned.html),
            }
            Ok(())
        }
        Commands::Detect { page } => {
            let html = fs::read_to_string(&page)
                .with_context(|| format!("Failed to read {}", page.display()))?;
            for marker in Marker::ALL {
                println!(
                    "{:<14} {}",
                    marker.name(),
                    if marker.matches(&html) { "yes" } else { "-" }
                );
            }
            match region::detect_marker(&html) {
                Some(m) => println!("\nManaged region found (first marker: {})", m.name()),
                None if region::has_legacy_block(&html) => {
                    println!("\nNo managed region; legacy AUTO-GENERATED block present")
                }
                None => println!("\nNo managed region"),
            }
            Ok(())
        }
        Commands::History { page, limit } => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            let rows = db::fetch_history(&conn, page.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No syncs recorded.");
                return Ok(());
            }

            println!(
                "{:>4} | {:<10} | {:<24} | {:<28} | {:>9} | {:<19} | {}",
                "Run", "Page", "Title", "Path", "Version", "Synced", "Error"
            );
            println!("{}", "-".repeat(120));

            for r in &rows {
                let version = match (r.version_before, r.version_after) {
                    (Some(b), Some(a)) => format!("{}->{}", b, a),
                    (Some(b), None) if r.changed => format!("{}->?", b),
                    (Some(b), None) => b.to_string(),
                    _ => "-".into(),
                };
                println!(
                    "{:>4} | {:<10} | {:<24} | {:<28} | {:>9} | {:<19} | {}",
                    r.run_id,
                    truncate(&r.page_id, 10),
                    truncate(&r.title, 24),
                    truncate(&r.merge_path, 28),
                    version,
                    truncate(&r.synced_at, 19),
                    r.error.as_deref().map(|e| truncate(e, 60)).unwrap_or_default()
                );
            }

            println!("\n{} syncs", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect()?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Runs:       {}", s.runs);
            println!("Page syncs: {}", s.page_syncs);
            println!("Changed:    {}", s.changed);
            println!("Errors:     {}", s.errors);
            println!("Appended:   {}", s.appended);
            if s.appended > 1 {
                println!("\nMore than one append recorded: check whether the host strips region markers.");
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
