//! Pattern denylist and URL policy over message text.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::message::domain::Message;
use crate::verification::domain::{RuleDescriptor, RuleViolation};
use crate::verification::error::RuleConfigError;
use crate::verification::json::{
    URL_PATTERN, domain_allowed, domain_of, metadata_value, url_regex,
};
use crate::verification::ports::ValidationRule;

/// Patterns refused unless configuration says otherwise. Matching is
/// case-insensitive.
pub const DEFAULT_FORBIDDEN_PATTERNS: &[&str] = &[
    r"password\s*=",
    r"api[_-]?key\s*=",
    r"secret\s*=",
    r"<script",
];

/// Default maximum number of URLs per message.
pub const DEFAULT_MAX_URLS: usize = 10;

/// Parameters of [`ContentValidator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentParams {
    /// Regular expressions that must not occur.
    pub forbidden_patterns: Vec<String>,
    /// Hosts URLs may point at (suffix match). `None` allows any host.
    pub allowed_domains: Option<Vec<String>>,
    /// Maximum number of URLs.
    pub max_urls: usize,
    /// Also scan the metadata map.
    pub include_metadata: bool,
}

impl Default for ContentParams {
    fn default() -> Self {
        Self {
            forbidden_patterns: DEFAULT_FORBIDDEN_PATTERNS
                .iter()
                .map(|pattern| (*pattern).to_owned())
                .collect(),
            allowed_domains: None,
            max_urls: DEFAULT_MAX_URLS,
            include_metadata: false,
        }
    }
}

/// Rejects messages containing forbidden patterns or disallowed URLs.
#[derive(Debug, Clone)]
pub struct ContentValidator {
    descriptor: RuleDescriptor,
    forbidden: Vec<Regex>,
    urls: Regex,
    allowed_domains: Option<Vec<String>>,
    max_urls: usize,
    include_metadata: bool,
}

impl ContentValidator {
    /// Compiles the validator.
    ///
    /// # Errors
    ///
    /// Returns [`RuleConfigError::InvalidPattern`] if a pattern does not
    /// compile.
    pub fn new(descriptor: RuleDescriptor, params: ContentParams) -> Result<Self, RuleConfigError> {
        let forbidden = params
            .forbidden_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| RuleConfigError::pattern(&descriptor.name, pattern, &err))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let urls = url_regex()
            .map_err(|err| RuleConfigError::pattern(&descriptor.name, URL_PATTERN, &err))?;
        Ok(Self {
            descriptor,
            forbidden,
            urls,
            allowed_domains: params.allowed_domains,
            max_urls: params.max_urls,
            include_metadata: params.include_metadata,
        })
    }

    fn scanned_text(&self, message: &Message) -> String {
        let mut text = message.payload().to_string();
        if self.include_metadata && !message.metadata().is_empty() {
            text.push('\n');
            text.push_str(&metadata_value(message.metadata()).to_string());
        }
        text
    }
}

impl ValidationRule for ContentValidator {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn check(&self, message: &Message) -> Result<(), RuleViolation> {
        let text = self.scanned_text(message);

        for (index, pattern) in self.forbidden.iter().enumerate() {
            if pattern.is_match(&text) {
                return Err(RuleViolation::new(
                    &self.descriptor,
                    format!(
                        "Content contains forbidden pattern {}",
                        index.saturating_add(1)
                    ),
                )
                .with_detail(pattern.as_str()));
            }
        }

        let urls: Vec<&str> = self.urls.find_iter(&text).map(|found| found.as_str()).collect();
        if urls.len() > self.max_urls {
            return Err(RuleViolation::new(
                &self.descriptor,
                format!(
                    "Message contains too many URLs ({} > {})",
                    urls.len(),
                    self.max_urls
                ),
            ));
        }

        if let Some(allowed) = &self.allowed_domains
            && let Some(url) = urls
                .iter()
                .find(|url| !domain_allowed(domain_of(url), allowed))
        {
            return Err(RuleViolation::new(
                &self.descriptor,
                format!("URL contains disallowed domain: {}", domain_of(url)),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rstest::rstest;
    use serde_json::json;

    fn text(body: &str) -> Message {
        Message::builder("planner", "coder")
            .with_text(body)
            .build(&ManualClock::default())
            .expect("valid message")
    }

    fn validator(params: ContentParams) -> ContentValidator {
        ContentValidator::new(RuleDescriptor::new("content", 30), params)
            .expect("patterns compile")
    }

    #[rstest]
    #[case("login with PASSWORD=hunter2")]
    #[case("here is my api_key=abc")]
    fn default_patterns_catch_credentials(#[case] body: &str) {
        let violation = validator(ContentParams::default())
            .check(&text(body))
            .expect_err("must be rejected");

        assert!(violation.reason.starts_with("Content contains forbidden pattern"));
        assert!(violation.detail.is_some());
        assert!(!violation.reason.contains("password"));
    }

    #[test]
    fn url_count_is_bounded() {
        let params = ContentParams {
            max_urls: 1,
            ..ContentParams::default()
        };
        let message = text("see https://a.example.com and https://b.example.com");

        let violation = validator(params).check(&message).expect_err("must be rejected");

        assert_eq!(violation.reason, "Message contains too many URLs (2 > 1)");
    }

    #[test]
    fn urls_must_point_at_allowed_domains() {
        let params = ContentParams {
            allowed_domains: Some(vec!["example.com".to_owned()]),
            ..ContentParams::default()
        };
        let checker = validator(params);

        assert!(checker.check(&text("docs at https://docs.example.com/x")).is_ok());
        let violation = checker
            .check(&text("fetch https://evil.test/payload"))
            .expect_err("must be rejected");
        assert_eq!(violation.reason, "URL contains disallowed domain: evil.test");
    }

    #[rstest]
    #[case("https://example.com/x", true)]
    #[case("https://Docs.Example.COM/x", true)]
    #[case("https://evilexample.com/x", false)]
    #[case("https://example.com.evil.test/x", false)]
    fn allowed_domains_match_whole_labels(#[case] url: &str, #[case] allowed: bool) {
        let params = ContentParams {
            allowed_domains: Some(vec!["example.com".to_owned()]),
            ..ContentParams::default()
        };

        let result = validator(params).check(&text(&format!("see {url}")));

        assert_eq!(result.is_ok(), allowed, "{url}");
    }

    #[test]
    fn metadata_is_scanned_on_request() {
        let message = Message::builder("planner", "coder")
            .with_json(json!({"text": "clean"}))
            .with_metadata("note", json!("secret = 42"))
            .build(&ManualClock::default())
            .expect("valid message");

        assert!(validator(ContentParams::default()).check(&message).is_ok());
        let strict = ContentParams {
            include_metadata: true,
            ..ContentParams::default()
        };
        assert!(validator(strict).check(&message).is_err());
    }

    #[test]
    fn invalid_patterns_fail_to_compile() {
        let params = ContentParams {
            forbidden_patterns: vec!["(unclosed".to_owned()],
            ..ContentParams::default()
        };

        let result = ContentValidator::new(RuleDescriptor::new("content", 30), params);

        assert!(matches!(result, Err(RuleConfigError::InvalidPattern { .. })));
    }
}
