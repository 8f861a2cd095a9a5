//! Data-driven construction of rule sets.
//!
//! Rule sets are described by [`VerificationSettings`], a list of tagged
//! [`ValidatorSpec`] and [`SanitizerSpec`] entries, and built by a
//! [`RuleRegistry`] that knows every built-in kind plus any custom kinds
//! registered by the host.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::verification::domain::RuleDescriptor;
use crate::verification::error::RuleConfigError;
use crate::verification::ports::{AccessTable, SanitizationRule, ValidationRule};
use crate::verification::sanitizers::{
    DepthCapParams, DepthCapSanitizer, KeyRedactionParams, KeyRedactionSanitizer,
    TermFilterParams, TermFilterSanitizer, TruncationParams, TruncationSanitizer,
};
use crate::verification::validators::{
    ContentParams, ContentValidator, IntegrityValidator, PermissionParams, PermissionValidator,
    SchemaParams, SchemaValidator, SizeParams, SizeValidator,
};

/// Builds a custom validator from its descriptor and raw parameters.
pub type ValidatorFactory =
    Arc<dyn Fn(RuleDescriptor, &Value) -> Result<Arc<dyn ValidationRule>, RuleConfigError> + Send + Sync>;

/// Builds a custom sanitizer from its descriptor and raw parameters.
pub type SanitizerFactory = Arc<
    dyn Fn(RuleDescriptor, &Value) -> Result<Arc<dyn SanitizationRule>, RuleConfigError>
        + Send
        + Sync,
>;

/// Validator variants understood by [`RuleRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidatorKind {
    /// [`SchemaValidator`].
    Schema(SchemaParams),
    /// [`SizeValidator`].
    Size(SizeParams),
    /// [`ContentValidator`].
    Content(ContentParams),
    /// [`PermissionValidator`].
    Permission(PermissionParams),
    /// [`IntegrityValidator`].
    Integrity,
    /// A kind registered with [`RuleRegistry::register_validator`].
    Custom {
        /// Registered kind name.
        kind: String,
        /// Parameters handed to the factory.
        #[serde(default)]
        params: Value,
    },
}

impl ValidatorKind {
    fn default_name(&self) -> &str {
        match self {
            Self::Schema(_) => "schema",
            Self::Size(_) => "size",
            Self::Content(_) => "content",
            Self::Permission(_) => "permission",
            Self::Integrity => "integrity",
            Self::Custom { kind, .. } => kind,
        }
    }

    const fn default_priority(&self) -> i32 {
        match self {
            Self::Schema(_) => 10,
            Self::Size(_) => 20,
            Self::Content(_) => 30,
            Self::Permission(_) => 40,
            Self::Integrity => 50,
            Self::Custom { .. } => 100,
        }
    }
}

/// Sanitizer variants understood by [`RuleRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SanitizerKind {
    /// [`DepthCapSanitizer`].
    DepthCap(DepthCapParams),
    /// [`KeyRedactionSanitizer`].
    KeyRedaction(KeyRedactionParams),
    /// [`TermFilterSanitizer`].
    TermFilter(TermFilterParams),
    /// [`TruncationSanitizer`].
    Truncation(TruncationParams),
    /// A kind registered with [`RuleRegistry::register_sanitizer`].
    Custom {
        /// Registered kind name.
        kind: String,
        /// Parameters handed to the factory.
        #[serde(default)]
        params: Value,
    },
}

impl SanitizerKind {
    fn default_name(&self) -> &str {
        match self {
            Self::DepthCap(_) => "depth_cap",
            Self::KeyRedaction(_) => "key_redaction",
            Self::TermFilter(_) => "term_filter",
            Self::Truncation(_) => "truncation",
            Self::Custom { kind, .. } => kind,
        }
    }

    const fn default_priority(&self) -> i32 {
        match self {
            Self::DepthCap(_) => 10,
            Self::KeyRedaction(_) => 20,
            Self::TermFilter(_) => 30,
            Self::Truncation(_) => 40,
            Self::Custom { .. } => 100,
        }
    }
}

const fn enabled_by_default() -> bool {
    true
}

/// One validator entry of a rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSpec {
    /// Reported name; defaults to the kind name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Scheduling; defaults per kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Disabled entries are built but skipped.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Variant and its parameters.
    #[serde(flatten)]
    pub kind: ValidatorKind,
}

impl ValidatorSpec {
    /// Creates an enabled entry with default name and priority.
    #[must_use]
    pub const fn new(kind: ValidatorKind) -> Self {
        Self {
            name: None,
            priority: None,
            enabled: true,
            kind,
        }
    }

    /// Overrides the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Overrides the name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the descriptor the rule is built with.
    #[must_use]
    pub fn descriptor(&self) -> RuleDescriptor {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| self.kind.default_name().to_owned());
        RuleDescriptor::new(name, self.priority.unwrap_or_else(|| self.kind.default_priority()))
            .with_enabled(self.enabled)
    }
}

/// One sanitizer entry of a rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizerSpec {
    /// Reported name; defaults to the kind name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Scheduling; defaults per kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Disabled entries are built but skipped.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Variant and its parameters.
    #[serde(flatten)]
    pub kind: SanitizerKind,
}

impl SanitizerSpec {
    /// Creates an enabled entry with default name and priority.
    #[must_use]
    pub const fn new(kind: SanitizerKind) -> Self {
        Self {
            name: None,
            priority: None,
            enabled: true,
            kind,
        }
    }

    /// Overrides the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Overrides the name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the descriptor the rule is built with.
    #[must_use]
    pub fn descriptor(&self) -> RuleDescriptor {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| self.kind.default_name().to_owned());
        RuleDescriptor::new(name, self.priority.unwrap_or_else(|| self.kind.default_priority()))
            .with_enabled(self.enabled)
    }
}

/// The full rule configuration of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// Validators, in any order.
    pub validators: Vec<ValidatorSpec>,
    /// Sanitizers, in any order.
    pub sanitizers: Vec<SanitizerSpec>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            validators: vec![
                ValidatorSpec::new(ValidatorKind::Schema(SchemaParams::default())),
                ValidatorSpec::new(ValidatorKind::Size(SizeParams::default())),
                ValidatorSpec::new(ValidatorKind::Content(ContentParams::default())),
                ValidatorSpec::new(ValidatorKind::Permission(PermissionParams::default())),
                ValidatorSpec::new(ValidatorKind::Integrity),
            ],
            sanitizers: vec![
                SanitizerSpec::new(SanitizerKind::DepthCap(DepthCapParams::default())),
                SanitizerSpec::new(SanitizerKind::KeyRedaction(KeyRedactionParams::default())),
                SanitizerSpec::new(SanitizerKind::TermFilter(TermFilterParams::default())),
                SanitizerSpec::new(SanitizerKind::Truncation(TruncationParams::default())),
            ],
        }
    }
}

impl VerificationSettings {
    /// Settings with no rules at all.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            validators: Vec::new(),
            sanitizers: Vec::new(),
        }
    }
}

/// Built rules ordered by ascending priority.
#[derive(Clone, Default)]
pub struct RuleSet {
    validators: Vec<Arc<dyn ValidationRule>>,
    sanitizers: Vec<Arc<dyn SanitizationRule>>,
}

impl RuleSet {
    /// Orders the given rules into a set. Equal priorities keep their
    /// relative order.
    #[must_use]
    pub fn new(
        mut validators: Vec<Arc<dyn ValidationRule>>,
        mut sanitizers: Vec<Arc<dyn SanitizationRule>>,
    ) -> Self {
        validators.sort_by_key(|rule| rule.descriptor().priority);
        sanitizers.sort_by_key(|rule| rule.descriptor().priority);
        Self {
            validators,
            sanitizers,
        }
    }

    /// Validators in execution order.
    #[must_use]
    pub fn validators(&self) -> &[Arc<dyn ValidationRule>] {
        &self.validators
    }

    /// Sanitizers in execution order.
    #[must_use]
    pub fn sanitizers(&self) -> &[Arc<dyn SanitizationRule>] {
        &self.sanitizers
    }

    /// Names of every rule, validators first, in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.validators
            .iter()
            .map(|rule| rule.descriptor().name.clone())
            .chain(
                self.sanitizers
                    .iter()
                    .map(|rule| rule.descriptor().name.clone()),
            )
            .collect()
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("rules", &self.names())
            .finish()
    }
}

/// Turns [`VerificationSettings`] into a [`RuleSet`].
#[derive(Clone)]
pub struct RuleRegistry {
    access: Arc<dyn AccessTable>,
    validators: HashMap<String, ValidatorFactory>,
    sanitizers: HashMap<String, SanitizerFactory>,
}

impl RuleRegistry {
    /// Creates a registry whose permission validators consult `access`.
    #[must_use]
    pub fn new(access: Arc<dyn AccessTable>) -> Self {
        Self {
            access,
            validators: HashMap::new(),
            sanitizers: HashMap::new(),
        }
    }

    /// Registers a custom validator kind, replacing any earlier factory
    /// of the same kind.
    pub fn register_validator(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(RuleDescriptor, &Value) -> Result<Arc<dyn ValidationRule>, RuleConfigError>
        + Send
        + Sync
        + 'static,
    ) {
        self.validators.insert(kind.into(), Arc::new(factory));
    }

    /// Registers a custom sanitizer kind, replacing any earlier factory of
    /// the same kind.
    pub fn register_sanitizer(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(RuleDescriptor, &Value) -> Result<Arc<dyn SanitizationRule>, RuleConfigError>
        + Send
        + Sync
        + 'static,
    ) {
        self.sanitizers.insert(kind.into(), Arc::new(factory));
    }

    /// Builds every rule in `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`RuleConfigError`] if a rule fails to build, a custom kind
    /// is unknown or two rules share a name.
    pub fn build(&self, settings: &VerificationSettings) -> Result<RuleSet, RuleConfigError> {
        let mut names = HashSet::new();
        let validators = settings
            .validators
            .iter()
            .map(|spec| {
                let descriptor = spec.descriptor();
                claim_name(&mut names, &descriptor)?;
                self.build_validator(descriptor, &spec.kind)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sanitizers = settings
            .sanitizers
            .iter()
            .map(|spec| {
                let descriptor = spec.descriptor();
                claim_name(&mut names, &descriptor)?;
                self.build_sanitizer(descriptor, &spec.kind)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleSet::new(validators, sanitizers))
    }

    fn build_validator(
        &self,
        descriptor: RuleDescriptor,
        kind: &ValidatorKind,
    ) -> Result<Arc<dyn ValidationRule>, RuleConfigError> {
        let rule: Arc<dyn ValidationRule> = match kind {
            ValidatorKind::Schema(params) => {
                Arc::new(SchemaValidator::new(descriptor, params.clone()))
            }
            ValidatorKind::Size(params) => {
                for (field, limit) in [
                    ("max_message_bytes", params.max_message_bytes),
                    ("max_payload_bytes", params.max_payload_bytes),
                    ("max_metadata_bytes", params.max_metadata_bytes),
                ] {
                    require_positive(&descriptor, field, limit)?;
                }
                Arc::new(SizeValidator::new(descriptor, params.clone()))
            }
            ValidatorKind::Content(params) => {
                Arc::new(ContentValidator::new(descriptor, params.clone())?)
            }
            ValidatorKind::Permission(params) => Arc::new(PermissionValidator::new(
                descriptor,
                Arc::clone(&self.access),
                *params,
            )),
            ValidatorKind::Integrity => Arc::new(IntegrityValidator::new(descriptor)),
            ValidatorKind::Custom { kind, params } => {
                let factory = self
                    .validators
                    .get(kind)
                    .ok_or_else(|| RuleConfigError::UnknownKind(kind.clone()))?;
                factory(descriptor, params)?
            }
        };
        Ok(rule)
    }

    fn build_sanitizer(
        &self,
        descriptor: RuleDescriptor,
        kind: &SanitizerKind,
    ) -> Result<Arc<dyn SanitizationRule>, RuleConfigError> {
        let rule: Arc<dyn SanitizationRule> = match kind {
            SanitizerKind::DepthCap(params) => {
                require_positive(&descriptor, "max_depth", params.max_depth)?;
                Arc::new(DepthCapSanitizer::new(descriptor, *params))
            }
            SanitizerKind::KeyRedaction(params) => {
                Arc::new(KeyRedactionSanitizer::new(descriptor, params.clone()))
            }
            SanitizerKind::TermFilter(params) => {
                Arc::new(TermFilterSanitizer::new(descriptor, params.clone())?)
            }
            SanitizerKind::Truncation(params) => {
                require_positive(&descriptor, "max_text_length", params.max_text_length)?;
                Arc::new(TruncationSanitizer::new(descriptor, params.clone()))
            }
            SanitizerKind::Custom { kind, params } => {
                let factory = self
                    .sanitizers
                    .get(kind)
                    .ok_or_else(|| RuleConfigError::UnknownKind(kind.clone()))?;
                factory(descriptor, params)?
            }
        };
        Ok(rule)
    }
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("sanitizers", &self.sanitizers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn claim_name(names: &mut HashSet<String>, descriptor: &RuleDescriptor) -> Result<(), RuleConfigError> {
    if names.insert(descriptor.name.clone()) {
        Ok(())
    } else {
        Err(RuleConfigError::DuplicateName(descriptor.name.clone()))
    }
}

fn require_positive(
    descriptor: &RuleDescriptor,
    field: &str,
    value: usize,
) -> Result<(), RuleConfigError> {
    if value == 0 {
        return Err(RuleConfigError::InvalidParameter {
            rule: descriptor.name.clone(),
            reason: format!("{field} must be greater than zero"),
        });
    }
    Ok(())
}
