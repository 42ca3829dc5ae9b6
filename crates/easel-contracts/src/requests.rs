use serde::{Deserialize, Serialize};

use crate::outcome::ItemError;

pub const DEFAULT_STYLE: &str = "Uncategorized";
pub const DEFAULT_SIZE: &str = "1024x1024";

/// One tabular input row as the spreadsheet layer hands it over. Only the
/// prompt is required; missing style/size columns arrive as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub prompt: Option<String>,
    pub style: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default = "default_size")]
    pub size: String,
}

impl GenerationRequest {
    /// Trims all fields, applies the defaults, and rejects rows whose
    /// prompt is empty after trimming. Pure; no side effects.
    pub fn normalize(row: &RawRow) -> Result<Self, ItemError> {
        let prompt = row.prompt.as_deref().map(str::trim).unwrap_or_default();
        if prompt.is_empty() {
            return Err(ItemError::InvalidRequest(
                "row has no prompt".to_string(),
            ));
        }
        let style = row
            .style
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_STYLE);
        let size = row
            .size
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_SIZE);
        Ok(Self {
            prompt: prompt.to_string(),
            style: style.to_string(),
            size: size.to_string(),
        })
    }

    /// The prompt actually sent to the provider. The style is appended
    /// only when it is not already a case-insensitive substring of the
    /// prompt, so "a cat, watercolor" + "watercolor" stays unchanged.
    pub fn effective_prompt(&self) -> String {
        if self
            .prompt
            .to_lowercase()
            .contains(&self.style.to_lowercase())
        {
            return self.prompt.clone();
        }
        format!("{}, {}", self.prompt, self.style)
    }
}

fn default_style() -> String {
    DEFAULT_STYLE.to_string()
}

fn default_size() -> String {
    DEFAULT_SIZE.to_string()
}

#[cfg(test)]
mod tests {
    use crate::outcome::ItemError;

    use super::{GenerationRequest, RawRow, DEFAULT_SIZE, DEFAULT_STYLE};

    fn row(prompt: &str, style: Option<&str>, size: Option<&str>) -> RawRow {
        RawRow {
            prompt: Some(prompt.to_string()),
            style: style.map(str::to_string),
            size: size.map(str::to_string),
        }
    }

    #[test]
    fn normalize_applies_defaults() -> anyhow::Result<()> {
        let request = GenerationRequest::normalize(&row("a cat", None, None))
            .map_err(anyhow::Error::msg)?;
        assert_eq!(request.prompt, "a cat");
        assert_eq!(request.style, DEFAULT_STYLE);
        assert_eq!(request.size, DEFAULT_SIZE);
        Ok(())
    }

    #[test]
    fn normalize_trims_whitespace() -> anyhow::Result<()> {
        let request =
            GenerationRequest::normalize(&row("  a cat  ", Some(" watercolor "), Some(" 512x512 ")))
                .map_err(anyhow::Error::msg)?;
        assert_eq!(request.prompt, "a cat");
        assert_eq!(request.style, "watercolor");
        assert_eq!(request.size, "512x512");
        Ok(())
    }

    #[test]
    fn normalize_treats_blank_fields_as_missing() -> anyhow::Result<()> {
        let request = GenerationRequest::normalize(&row("a cat", Some("   "), Some("")))
            .map_err(anyhow::Error::msg)?;
        assert_eq!(request.style, DEFAULT_STYLE);
        assert_eq!(request.size, DEFAULT_SIZE);
        Ok(())
    }

    #[test]
    fn normalize_rejects_missing_prompt() {
        let rejected = GenerationRequest::normalize(&RawRow::default());
        assert!(matches!(rejected, Err(ItemError::InvalidRequest(_))));

        let blank = GenerationRequest::normalize(&row("   ", Some("x"), None));
        assert!(matches!(blank, Err(ItemError::InvalidRequest(_))));
    }

    #[test]
    fn effective_prompt_appends_missing_style() -> anyhow::Result<()> {
        let request = GenerationRequest::normalize(&row("a cat", Some("watercolor"), None))
            .map_err(anyhow::Error::msg)?;
        assert_eq!(request.effective_prompt(), "a cat, watercolor");
        Ok(())
    }

    #[test]
    fn effective_prompt_skips_style_already_present() -> anyhow::Result<()> {
        let request =
            GenerationRequest::normalize(&row("a cat, watercolor", Some("watercolor"), None))
                .map_err(anyhow::Error::msg)?;
        assert_eq!(request.effective_prompt(), "a cat, watercolor");
        Ok(())
    }

    #[test]
    fn effective_prompt_style_match_is_case_insensitive() -> anyhow::Result<()> {
        let request = GenerationRequest::normalize(&row("A WATERCOLOR cat", Some("Watercolor"), None))
            .map_err(anyhow::Error::msg)?;
        assert_eq!(request.effective_prompt(), "A WATERCOLOR cat");
        Ok(())
    }
}
