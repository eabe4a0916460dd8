//! Template-based script provider

use async_trait::async_trait;

use super::{ClientError, ClientResult, ScriptProvider};
use crate::model::ProductMetadata;

/// Default narration template
pub const DEFAULT_SCRIPT_TEMPLATE: &str = "Meet {title}. {description}";

/// Fills a template with product metadata
///
/// Supported placeholders: `{title}`, `{description}`, `{hashtags}` and
/// `{extra.<key>}` for string values of the free-form metadata.
#[derive(Debug, Clone)]
pub struct TemplateScriptProvider {
    template: String,
}

impl TemplateScriptProvider {
    /// Create a provider from a template
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Render the template for one product
    pub fn render(&self, metadata: &ProductMetadata) -> String {
        let hashtags = metadata
            .hashtags
            .iter()
            .map(|t| format!("#{}", t.trim().trim_start_matches('#')))
            .collect::<Vec<_>>()
            .join(" ");

        let mut text = self
            .template
            .replace("{title}", metadata.title.trim())
            .replace(
                "{description}",
                metadata.description.as_deref().unwrap_or_default().trim(),
            )
            .replace("{hashtags}", &hashtags);

        for (key, value) in &metadata.extra {
            let placeholder = format!("{{extra.{key}}}");
            if let Some(value) = value.as_str() {
                text = text.replace(&placeholder, value);
            }
        }

        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl Default for TemplateScriptProvider {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_TEMPLATE)
    }
}

#[async_trait]
impl ScriptProvider for TemplateScriptProvider {
    async fn script(&self, metadata: &ProductMetadata) -> ClientResult<String> {
        let text = self.render(metadata);
        if text.is_empty() {
            return Err(ClientError::other(
                "script template rendered to empty text (missing title?)",
            ));
        }
        Ok(text)
    }
}
