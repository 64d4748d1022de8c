//! Optional forwarding of persisted error rows to a Slack webhook.

use arca_protocol::errors::{ErrorCategory, ErrorSeverity};

use crate::config::ServerConfig;

pub struct Notifier {
    url: Option<String>,
    severities: Vec<ErrorSeverity>,
    categories: Vec<ErrorCategory>,
}

impl Notifier {
    pub fn disabled() -> Self {
        Self {
            url: None,
            severities: Vec::new(),
            categories: Vec::new(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, String> {
        if !config.slack_webhook_enable {
            return Ok(Self::disabled());
        }
        let path = config
            .slack_webhook_url_file
            .as_ref()
            .ok_or("slack webhook enabled without a URL file")?;
        let url = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read webhook URL file '{}': {e}", path.display()))?
            .trim()
            .to_string();

        let severities = config
            .slack_webhook_post_error_severity
            .iter()
            .filter_map(|s| ErrorSeverity::from_str_opt(s))
            .collect();
        let categories = config
            .slack_webhook_post_error_category
            .iter()
            .filter_map(|c| ErrorCategory::from_str_opt(c))
            .collect();

        Ok(Self {
            url: Some(url),
            severities,
            categories,
        })
    }

    fn wants(&self, severity: ErrorSeverity, category: ErrorCategory) -> bool {
        let severity_ok = self.severities.is_empty() || self.severities.contains(&severity);
        let category_ok = self.categories.is_empty() || self.categories.contains(&category);
        severity_ok && category_ok
    }

    /// Fire-and-forget: webhook failures must never take down the caller.
    pub fn post(&self, severity: ErrorSeverity, category: ErrorCategory, message: &str) {
        let Some(url) = &self.url else {
            return;
        };
        if !self.wants(severity, category) {
            return;
        }
        let text = format!("[{severity}/{category}] {message}");
        let url = url.clone();
        std::thread::spawn(move || {
            let result = ureq::post(&url).send_json(serde_json::json!({ "text": text }));
            if let Err(e) = result {
                tracing::warn!(error = %e, "slack webhook post failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_notifier_posts_nothing() {
        let notifier = Notifier::disabled();
        // No URL configured; must be a silent no-op.
        notifier.post(ErrorSeverity::Critical, ErrorCategory::Internal, "boom");
    }

    #[test]
    fn filters_respect_configured_sets() {
        let notifier = Notifier {
            url: Some("http://example.invalid".into()),
            severities: vec![ErrorSeverity::Critical],
            categories: vec![ErrorCategory::Store],
        };
        assert!(notifier.wants(ErrorSeverity::Critical, ErrorCategory::Store));
        assert!(!notifier.wants(ErrorSeverity::Warning, ErrorCategory::Store));
        assert!(!notifier.wants(ErrorSeverity::Critical, ErrorCategory::Peer));
    }

    #[test]
    fn empty_filters_match_everything() {
        let notifier = Notifier {
            url: Some("http://example.invalid".into()),
            severities: Vec::new(),
            categories: Vec::new(),
        };
        assert!(notifier.wants(ErrorSeverity::Info, ErrorCategory::Transport));
    }
}
