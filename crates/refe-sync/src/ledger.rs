//! Run records and the on-disk reports written next to them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use refe_core::{EntityKind, IngestionRun, RowError, RunStats, RunStatus};
use tokio::fs;
use uuid::Uuid;

use crate::reconcile::UpsertOutcome;

/// Upper bound on diagnostic lines copied into a run's error log.
pub const MAX_ERROR_LOG_LINES: usize = 200;

pub fn render_error_log(errors: &[RowError]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    let mut lines: Vec<String> = errors
        .iter()
        .take(MAX_ERROR_LOG_LINES)
        .map(|e| match &e.external_id {
            Some(id) => format!("row {} ({id}): {}", e.row_index, e.error),
            None => format!("row {}: {}", e.row_index, e.error),
        })
        .collect();
    if errors.len() > MAX_ERROR_LOG_LINES {
        lines.push(format!("... and {} more", errors.len() - MAX_ERROR_LOG_LINES));
    }
    Some(lines.join("\n"))
}

/// Run record for a pass that reached reconciliation.
pub fn completed_run(
    run_id: Uuid,
    source_id: &str,
    entity: EntityKind,
    started_at: DateTime<Utc>,
    outcome: &UpsertOutcome,
) -> IngestionRun {
    IngestionRun {
        id: run_id,
        source_id: source_id.to_string(),
        entity,
        started_at,
        finished_at: Utc::now(),
        status: outcome.status(),
        stats: outcome.stats(),
        error_log: render_error_log(&outcome.errors),
    }
}

/// Run record for a pass aborted before reconciliation. Stats stay zero.
pub fn failed_run(
    run_id: Uuid,
    source_id: &str,
    entity: EntityKind,
    started_at: DateTime<Utc>,
    message: String,
) -> IngestionRun {
    IngestionRun {
        id: run_id,
        source_id: source_id.to_string(),
        entity,
        started_at,
        finished_at: Utc::now(),
        status: RunStatus::Failed,
        stats: RunStats::default(),
        error_log: Some(message),
    }
}

/// Writes `run.json` and `summary.md` under `<reports_root>/<run id>/`.
pub async fn write_run_report(reports_root: &Path, run: &IngestionRun, errors: &[RowError]) -> Result<PathBuf> {
    let run_dir = reports_root.join(run.id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": run,
        "errors": errors,
    }))
    .context("serializing run report")?;
    fs::write(run_dir.join("run.json"), json)
        .await
        .context("writing run.json")?;

    fs::write(run_dir.join("summary.md"), render_run_summary(run))
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}

fn render_run_summary(run: &IngestionRun) -> String {
    let mut out = format!(
        "# Ingestion run `{}`\n\n- Feed: {}\n- Entity: {}\n- Status: {}\n- Started: {}\n- Finished: {}\n- Inserted: {}\n- Updated: {}\n- Hidden: {}\n",
        run.id,
        run.source_id,
        run.entity.as_str(),
        run.status.as_str(),
        run.started_at,
        run.finished_at,
        run.stats.inserted,
        run.stats.updated,
        run.stats.hidden,
    );
    if let Some(log) = &run.error_log {
        out.push_str("\n## Errors\n\n```\n");
        out.push_str(log);
        out.push_str("\n```\n");
    }
    out
}

/// Markdown digest of the most recent runs, newest first.
pub fn report_recent_runs(runs: &[IngestionRun], limit: usize) -> String {
    let mut lines = vec!["# REFE recent runs".to_string(), String::new()];
    if runs.is_empty() {
        lines.push("_No runs recorded yet._".to_string());
        return lines.join("\n");
    }

    lines.push("| Run | Feed | Entity | Status | Inserted | Updated | Hidden | Finished |".to_string());
    lines.push("|---|---|---|---|---|---|---|---|".to_string());
    let mut recent: Vec<&IngestionRun> = runs.iter().collect();
    recent.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
    for run in recent.into_iter().take(limit.max(1)) {
        lines.push(format!(
            "| `{}` | {} | {} | {} | {} | {} | {} | {} |",
            run.id,
            run.source_id,
            run.entity.as_str(),
            run.status.as_str(),
            run.stats.inserted,
            run.stats.updated,
            run.stats.hidden,
            run.finished_at.format("%Y-%m-%d %H:%M:%S"),
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn err(i: usize, id: Option<&str>) -> RowError {
        RowError {
            row_index: i,
            external_id: id.map(str::to_string),
            error: "missing or non-numeric price".into(),
        }
    }

    #[test]
    fn error_log_lists_rows_and_is_capped() {
        assert_eq!(render_error_log(&[]), None);
        let log = render_error_log(&[err(2, Some("p2")), err(5, None)]).unwrap();
        assert_eq!(log, "row 2 (p2): missing or non-numeric price\nrow 5: missing or non-numeric price");

        let many: Vec<RowError> = (1..=MAX_ERROR_LOG_LINES + 3).map(|i| err(i, None)).collect();
        let log = render_error_log(&many).unwrap();
        assert_eq!(log.lines().count(), MAX_ERROR_LOG_LINES + 1);
        assert!(log.ends_with("... and 3 more"));
    }

    #[test]
    fn failed_runs_carry_zero_stats() {
        let run = failed_run(Uuid::new_v4(), "acme", EntityKind::Properties, Utc::now(), "boom".into());
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stats, RunStats::default());
        assert_eq!(run.error_log.as_deref(), Some("boom"));
    }

    #[test]
    fn completed_run_status_follows_error_ratio() {
        let outcome = UpsertOutcome {
            inserted: 1,
            errors: vec![err(2, Some("p2"))],
            rows: 2,
            ..Default::default()
        };
        let run = completed_run(Uuid::new_v4(), "acme", EntityKind::Properties, Utc::now(), &outcome);
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.stats.inserted, 1);
    }

    #[test]
    fn recent_runs_are_listed_newest_first() {
        let older = failed_run(Uuid::new_v4(), "old-feed", EntityKind::Properties, Utc::now(), "x".into());
        let mut newer = failed_run(Uuid::new_v4(), "new-feed", EntityKind::Complexes, Utc::now(), "y".into());
        newer.finished_at = older.finished_at + chrono::Duration::seconds(5);

        let md = report_recent_runs(&[older, newer], 10);
        let new_at = md.find("new-feed").unwrap();
        let old_at = md.find("old-feed").unwrap();
        assert!(new_at < old_at);
        assert!(report_recent_runs(&[], 5).contains("No runs"));
    }

    #[tokio::test]
    async fn report_files_are_written_per_run() {
        let dir = tempdir().expect("tempdir");
        let run = failed_run(Uuid::new_v4(), "acme", EntityKind::Properties, Utc::now(), "fetch failed".into());
        let run_dir = write_run_report(dir.path(), &run, &[]).await.expect("report");

        assert_eq!(run_dir, dir.path().join(run.id.to_string()));
        let summary = std::fs::read_to_string(run_dir.join("summary.md")).unwrap();
        assert!(summary.contains("Status: failed"));
        assert!(summary.contains("fetch failed"));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("run.json")).unwrap()).unwrap();
        assert_eq!(json["run"]["sourceId"], "acme");
    }
}
