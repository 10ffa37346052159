use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Counters and bookkeeping for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub entity_type: String,
    pub provider: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub total: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub dry_run: bool,
    /// `succeeded * cost_per_image`; zero for dry runs.
    pub estimated_cost: f64,
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let mut payload = serde_json::to_value(summary)?;
    if let Value::Object(map) = &mut payload {
        map.insert("ts".to_string(), Value::String(now_utc_iso()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{write_summary, RunSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("runs").join("summary.json");

        let summary = RunSummary {
            run_id: "run-123".to_string(),
            entity_type: "spells".to_string(),
            provider: Some("dall-e".to_string()),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            total: 5,
            succeeded: 3,
            skipped: 1,
            failed: 1,
            dry_run: false,
            estimated_cost: 0.12,
        };
        write_summary(&path, &summary)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["provider"], json!("dall-e"));
        assert_eq!(parsed["succeeded"], json!(3));
        assert_eq!(parsed["failed"], json!(1));
        assert_eq!(parsed["estimated_cost"], json!(0.12));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
