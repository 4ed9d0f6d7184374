//! Inspect-checkpoint command implementation.

use serde::Serialize;
use std::fs;
use std::path::Path;
use tablesync_protocol::Checkpoint;

/// Checkpoint inspection result.
#[derive(Debug, Serialize)]
pub struct CheckpointSummary {
    /// Checkpoint file path.
    pub path: String,
    /// Format version.
    pub version: u32,
    /// Configuration the checkpoint belongs to.
    pub config_id: String,
    /// When the checkpoint was taken, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<String>,
    /// Number of rows tracked.
    pub entry_count: usize,
    /// Rows whose two sides hashed differently when last written.
    pub diverged_count: usize,
    /// Tracked rows (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntrySummary>>,
}

/// One tracked row.
#[derive(Debug, Serialize)]
pub struct EntrySummary {
    /// Row id.
    pub id: String,
    /// Record-side content hash.
    pub left_hash: String,
    /// Spreadsheet-side content hash.
    pub right_hash: String,
}

/// Runs the inspect-checkpoint command.
pub fn run(path: &Path, show_entries: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let summary = inspect(path, show_entries)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_text(&summary),
    }
    Ok(())
}

/// Loads a checkpoint file and summarizes it.
pub fn inspect(path: &Path, show_entries: bool) -> Result<CheckpointSummary, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No checkpoint found at {:?}", path).into());
    }
    let json = fs::read_to_string(path)?;
    let checkpoint = Checkpoint::from_json(&json)?;

    let diverged_count = checkpoint
        .entries
        .values()
        .filter(|entry| entry.left_hash != entry.right_hash)
        .count();

    let entries = show_entries.then(|| {
        checkpoint
            .entries
            .iter()
            .map(|(id, entry)| EntrySummary {
                id: id.to_string(),
                left_hash: entry.left_hash.to_string(),
                right_hash: entry.right_hash.to_string(),
            })
            .collect()
    });

    Ok(CheckpointSummary {
        path: path.display().to_string(),
        version: checkpoint.version,
        taken_at: checkpoint.taken_at.map(|t| t.to_rfc3339()),
        entry_count: checkpoint.len(),
        diverged_count,
        config_id: checkpoint.config_id,
        entries,
    })
}

fn print_text(summary: &CheckpointSummary) {
    println!("Checkpoint: {}", summary.path);
    println!();
    println!("Version:          {}", summary.version);
    println!("Configuration:    {}", summary.config_id);
    println!(
        "Taken at:         {}",
        summary.taken_at.as_deref().unwrap_or("never")
    );
    println!("Entries:          {}", summary.entry_count);
    if summary.diverged_count > 0 {
        println!("Diverged hashes:  {}", summary.diverged_count);
    }

    if let Some(entries) = &summary.entries {
        println!();
        println!("{:<24} {:<18} {:<18}", "Row", "Left", "Right");
        println!("{}", "-".repeat(62));
        for entry in entries {
            println!(
                "{:<24} {:<18} {:<18}",
                entry.id,
                short(&entry.left_hash),
                short(&entry.right_hash)
            );
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}
