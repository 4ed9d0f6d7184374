//! Run command implementation.

use crate::files::{links_json, load_links, read_json, write_json, EndpointFile};
use std::path::PathBuf;
use std::sync::Arc;
use tablesync_engine::{
    CheckpointStore, CrossReferenceResolver, EngineConfig, FileCheckpointStore,
    JsonLinesAuditSink, RateLimitConfig, RunReport, RunStatus, SyncOrchestrator, SystemClock,
};
use tablesync_protocol::SyncConfiguration;
use tracing::info;

/// Inputs of one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Sync configuration file.
    pub config: PathBuf,
    /// Record endpoint file.
    pub left: PathBuf,
    /// Spreadsheet endpoint file.
    pub right: PathBuf,
    /// Linked tables file.
    pub links: Option<PathBuf>,
    /// Directory holding checkpoints and locks.
    pub state_dir: PathBuf,
    /// Requests per second per endpoint; zero is unlimited.
    pub requests_per_second: u32,
    /// JSON lines file receiving run reports.
    pub audit_log: Option<PathBuf>,
    /// Skip writing endpoints and checkpoint back.
    pub dry_run: bool,
}

/// Runs the run command.
pub fn run(options: &RunOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = execute(options)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(&report),
    }

    if report.status == RunStatus::Failed {
        return Err(format!("sync {} failed", report.config_id).into());
    }
    Ok(())
}

/// Syncs the two endpoint files and persists the results.
pub fn execute(options: &RunOptions) -> Result<RunReport, Box<dyn std::error::Error>> {
    let config: SyncConfiguration = read_json(&options.config)?;

    let store = FileCheckpointStore::open(&options.state_dir)?;
    let _lock = store.lock(&config.id)?;
    let checkpoint = store.load(&config.id)?;

    let left = Arc::new(EndpointFile::load(&options.left)?.into_endpoint("records"));
    let right = Arc::new(EndpointFile::load(&options.right)?.into_endpoint("sheet"));

    let rate = RateLimitConfig::new(options.requests_per_second);
    let engine = EngineConfig::new()
        .with_left_rate_limit(rate)
        .with_right_rate_limit(rate);
    let ttl = engine.cross_ref_ttl;
    let mut sync = SyncOrchestrator::new(left.clone(), right.clone(), engine);

    let linked = match &options.links {
        Some(path) => Some(Arc::new(load_links(path)?)),
        None => None,
    };
    if let Some(linked) = &linked {
        let resolver = CrossReferenceResolver::new(
            linked.clone(),
            sync.left_guard(),
            ttl,
            Arc::new(SystemClock::new()),
        );
        sync = sync.with_cross_references(Arc::new(resolver));
    }
    if let Some(path) = &options.audit_log {
        sync = sync.with_audit_sink(Arc::new(JsonLinesAuditSink::new(path)));
    }

    info!(
        config_id = %config.id,
        checkpoint_entries = checkpoint.len(),
        "starting sync"
    );
    let outcome = sync.run_sync(&config, &checkpoint);

    if options.dry_run {
        info!("dry run, nothing written back");
        return Ok(outcome.report);
    }

    EndpointFile::from_endpoint(&left).save(&options.left)?;
    EndpointFile::from_endpoint(&right).save(&options.right)?;
    if let (Some(path), Some(linked)) = (&options.links, &linked) {
        let tables: Vec<String> = config
            .mapping
            .linked_entries()
            .map(|(_, link)| link.table.clone())
            .collect();
        write_json(path, &links_json(linked, &tables))?;
    }
    store.save(&outcome.checkpoint)?;

    Ok(outcome.report)
}

fn print_text(report: &RunReport) {
    println!("{}", report.summary());
    println!();
    println!(
        "Detected:         {} unchanged, {} conflicting",
        report.detection.unchanged, report.detection.both_changed
    );
    println!(
        "Left -> right:    {} added, {} updated, {} deleted",
        report.left_to_right.added, report.left_to_right.updated, report.left_to_right.deleted
    );
    println!(
        "Right -> left:    {} added, {} updated, {} deleted",
        report.right_to_left.added, report.right_to_left.updated, report.right_to_left.deleted
    );
    println!();

    println!("Phases:");
    for phase in &report.phases {
        let name = phase.phase.to_string();
        let status = format!("{:?}", phase.status);
        println!(
            "  {name:<22} {status:<20} {:>6} ms",
            phase.duration.as_millis()
        );
        for error in &phase.errors {
            println!("    error: {error}");
        }
        for warning in &phase.warnings {
            println!("    warning: {warning}");
        }
    }

    if !report.resolutions.is_empty() {
        println!();
        println!("Conflicts:");
        for entry in &report.resolutions {
            println!(
                "  {} {:?} -> {:?}{} ({})",
                entry.row_id,
                entry.kind,
                entry.winner,
                if entry.deleted { " (delete)" } else { "" },
                entry.rationale
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::Checkpoint;
    use tablesync_testkit::{numbered_people, plain_mapping, TempStateDir};

    fn options(dir: &TempStateDir) -> RunOptions {
        RunOptions {
            config: dir.file("config.json"),
            left: dir.file("left.json"),
            right: dir.file("right.json"),
            links: None,
            state_dir: dir.file("state"),
            requests_per_second: 0,
            audit_log: Some(dir.file("audit.jsonl")),
            dry_run: false,
        }
    }

    fn seed(dir: &TempStateDir) {
        let config = SyncConfiguration::new("people", plain_mapping());
        write_json(&dir.file("config.json"), &config).unwrap();
        let left = EndpointFile {
            rows: numbered_people(3),
            ..EndpointFile::default()
        };
        left.save(&dir.file("left.json")).unwrap();
    }

    #[test]
    fn run_writes_sheet_and_checkpoint() {
        let dir = TempStateDir::new();
        seed(&dir);
        let options = options(&dir);

        let report = execute(&options).unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.left_to_right.added, 3);

        let right = EndpointFile::load(&options.right).unwrap();
        assert_eq!(right.rows.len(), 3);

        let checkpoint: Checkpoint =
            read_json(&options.state_dir.join("people.checkpoint.json")).unwrap();
        assert_eq!(checkpoint.len(), 3);

        let second = execute(&options).unwrap();
        assert_eq!(second.total_writes(), 0);

        let audit = std::fs::read_to_string(dir.file("audit.jsonl")).unwrap();
        assert_eq!(audit.lines().count(), 2);
    }

    #[test]
    fn dry_run_leaves_files_alone() {
        let dir = TempStateDir::new();
        seed(&dir);
        let options = RunOptions {
            dry_run: true,
            ..options(&dir)
        };

        let report = execute(&options).unwrap();
        assert_eq!(report.left_to_right.added, 3);
        assert!(!options.right.exists());
        assert!(!options.state_dir.join("people.checkpoint.json").exists());
    }

    #[test]
    fn invalid_mapping_fails_the_command() {
        let dir = TempStateDir::new();
        seed(&dir);
        std::fs::write(
            dir.file("config.json"),
            r#"{ "id": "people", "mapping": [
                { "field_id": "fldName", "column": 0 },
                { "field_id": "fldEmail", "column": 0 }
            ] }"#,
        )
        .unwrap();

        let err = run(&options(&dir), "json").unwrap_err();
        assert!(err.to_string().contains("people"));
    }
}
