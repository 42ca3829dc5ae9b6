use chrono::{DateTime, Local};

/// Identifier for one orchestrator run, derived from the creation
/// timestamp. Two runs started in the same minute share an id; the
/// storage layer treats that as the same remote root name.
pub fn session_id_at(moment: &DateTime<Local>) -> String {
    moment.format("Session_%Y-%m-%d_%H%M").to_string()
}

pub fn new_session_id() -> String {
    session_id_at(&Local::now())
}

/// Created once per run after the remote root folder exists; immutable
/// for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub root_folder_id: String,
}

/// Explicit credential bundle handed to the engine at construction.
/// Nothing here is ever stored in process-wide state.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub image_api_key: Option<String>,
    pub storage_token: Option<String>,
    pub mail_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            image_api_key: non_empty_env("OPENAI_API_KEY"),
            storage_token: non_empty_env("EASEL_STORAGE_TOKEN"),
            mail_api_key: non_empty_env("EASEL_MAIL_API_KEY"),
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::{new_session_id, session_id_at};

    #[test]
    fn session_id_uses_timestamp_format() {
        let moment = chrono::Local
            .with_ymd_and_hms(2026, 8, 6, 14, 30, 59)
            .single()
            .expect("valid timestamp");
        assert_eq!(session_id_at(&moment), "Session_2026-08-06_1430");
    }

    #[test]
    fn new_session_id_has_expected_shape() {
        let id = new_session_id();
        assert!(id.starts_with("Session_"));
        assert_eq!(id.len(), "Session_2026-08-06_1430".len());
    }
}
