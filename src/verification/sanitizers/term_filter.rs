//! Denylisted-term replacement with optional URL filtering.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::domain::Message;
use crate::verification::domain::RuleDescriptor;
use crate::verification::error::RuleConfigError;
use crate::verification::json::{
    URL_PATTERN, domain_allowed, domain_of, metadata_map, metadata_value, rewrite_strings,
    url_regex,
};
use crate::verification::ports::SanitizationRule;

/// Default replacement text.
pub const DEFAULT_REPLACEMENT: &str = "[FILTERED]";

/// Parameters of [`TermFilterSanitizer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TermFilterParams {
    /// Whole words replaced wherever they appear, ignoring case.
    pub terms: Vec<String>,
    /// Text substituted for each match.
    pub replacement: String,
    /// Replace URLs whose host is not allowed.
    pub filter_urls: bool,
    /// Hosts kept when filtering URLs (suffix match).
    pub allowed_domains: Vec<String>,
    /// Also filter metadata strings.
    pub include_metadata: bool,
}

impl Default for TermFilterParams {
    fn default() -> Self {
        Self {
            terms: Vec::new(),
            replacement: DEFAULT_REPLACEMENT.to_owned(),
            filter_urls: false,
            allowed_domains: Vec::new(),
            include_metadata: false,
        }
    }
}

/// Replaces denylisted words, and optionally foreign URLs, in every string
/// of the payload.
#[derive(Debug, Clone)]
pub struct TermFilterSanitizer {
    descriptor: RuleDescriptor,
    terms: Vec<Regex>,
    urls: Option<Regex>,
    params: TermFilterParams,
}

impl TermFilterSanitizer {
    /// Compiles the sanitizer.
    ///
    /// # Errors
    ///
    /// Returns [`RuleConfigError::InvalidPattern`] if a term cannot be
    /// compiled.
    pub fn new(
        descriptor: RuleDescriptor,
        params: TermFilterParams,
    ) -> Result<Self, RuleConfigError> {
        let terms = params
            .terms
            .iter()
            .map(|term| {
                let pattern = format!(r"\b{}\b", regex::escape(term));
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| RuleConfigError::pattern(&descriptor.name, &pattern, &err))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let urls = if params.filter_urls {
            Some(
                url_regex()
                    .map_err(|err| RuleConfigError::pattern(&descriptor.name, URL_PATTERN, &err))?,
            )
        } else {
            None
        };
        Ok(Self {
            descriptor,
            terms,
            urls,
            params,
        })
    }

    fn filter(&self, text: &str) -> Option<String> {
        let mut filtered = text.to_owned();
        for term in &self.terms {
            if term.is_match(&filtered) {
                filtered = term
                    .replace_all(&filtered, self.params.replacement.as_str())
                    .into_owned();
            }
        }
        if let Some(urls) = &self.urls {
            filtered = urls
                .replace_all(&filtered, |found: &regex::Captures<'_>| {
                    let url = found.get(0).map_or("", |matched| matched.as_str());
                    if domain_allowed(domain_of(url), &self.params.allowed_domains) {
                        url.to_owned()
                    } else {
                        self.params.replacement.clone()
                    }
                })
                .into_owned();
        }
        (filtered != text).then_some(filtered)
    }

    fn filter_value(&self, value: &mut Value) -> bool {
        rewrite_strings(value, &|text: &str| self.filter(text))
    }
}

impl SanitizationRule for TermFilterSanitizer {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn transform(&self, message: &Message) -> Option<Message> {
        let mut payload = message.payload().clone();
        let payload_changed = self.filter_value(&mut payload);

        let mut metadata = metadata_value(message.metadata());
        let metadata_changed = self.params.include_metadata && self.filter_value(&mut metadata);

        match (payload_changed, metadata_changed) {
            (false, false) => None,
            (true, false) => Some(message.with_payload(payload)),
            (false, true) => Some(message.with_metadata(metadata_map(metadata))),
            (true, true) => Some(
                message
                    .with_payload(payload)
                    .with_metadata(metadata_map(metadata)),
            ),
        }
    }
}
