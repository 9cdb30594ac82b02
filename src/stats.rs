//! Collection overview.
//!
//! `notectx collections` lists every live collection with its embedding
//! model, dims, and note/chunk counts, so it is easy to confirm that an
//! indexing run landed.

use anyhow::Result;

use notectx_core::registry::CollectionRegistry;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Run the collections command: list collections and print a summary.
pub async fn run_collections(config: &Config, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let collections = CollectionRegistry::new(&store).list().await;
    store.pool().close().await;
    let collections = collections?;

    if json {
        println!("{}", serde_json::to_string_pretty(&collections)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    if collections.is_empty() {
        println!("No collections. Run `notectx index --all` first.");
        return Ok(());
    }

    println!(
        "  {:<20} {:<24} {:>5} {:>6} {:>8}   {}",
        "COLLECTION", "MODEL", "DIMS", "NOTES", "CHUNKS", "UPDATED"
    );
    println!("  {}", "-".repeat(84));
    for c in &collections {
        println!(
            "  {:<20} {:<24} {:>5} {:>6} {:>8}   {}",
            c.name,
            c.embedding_model,
            c.dims,
            c.note_count,
            c.chunk_count,
            format_ts_relative(c.updated_at.timestamp())
        );
        if !c.description.is_empty() {
            println!("    {}", c.description);
        }
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
