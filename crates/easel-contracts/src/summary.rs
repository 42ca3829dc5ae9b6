use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub log_path: String,
    pub archive_path: String,
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = serde_json::to_value(summary)?
        .as_object()
        .cloned()
        .unwrap_or_default();
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, RunSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let summary = RunSummary {
            session_id: "Session_2026-08-06_1430".to_string(),
            started_at: "2026-08-06T14:30:00+00:00".to_string(),
            finished_at: "2026-08-06T14:40:00+00:00".to_string(),
            total_requests: 3,
            succeeded: 2,
            failed: 1,
            log_path: "run/upload_log.csv".to_string(),
            archive_path: "run/generated_images.zip".to_string(),
        };
        let mut extra = Map::new();
        extra.insert("cancelled".to_string(), Value::Bool(false));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["session_id"], json!("Session_2026-08-06_1430"));
        assert_eq!(parsed["total_requests"], json!(3));
        assert_eq!(parsed["succeeded"], json!(2));
        assert_eq!(parsed["failed"], json!(1));
        assert_eq!(parsed["archive_path"], json!("run/generated_images.zip"));
        assert_eq!(parsed["cancelled"], json!(false));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
