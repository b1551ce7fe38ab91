//! Analysis configuration: which faults apply to which calls.
//!
//! An [`AnalysisConfiguration`] pairs a call-site matcher with the
//! candidate faults for matching calls.  An [`AnalysisConfigurationFile`]
//! groups named configurations with the [`ExplorationPolicy`] that bounds
//! the search.  Matchers are case-insensitive regular expressions with
//! "find" semantics (a match anywhere in the text counts), compiled once
//! when the configuration is built.
//!
//! On disk the file is JSON:
//!
//! ```json
//! {
//!   "policy": { "strategy": "breadth_first", "combinatorial": false },
//!   "analysis": {
//!     "grpc.exceptions": {
//!       "pattern": "(.*/.*)",
//!       "rpc_type": "grpc",
//!       "exceptions": [
//!         { "name": "io.grpc.StatusRuntimeException", "metadata": { "code": "UNAVAILABLE" } }
//!       ]
//!     }
//!   }
//! }
//! ```

use crate::dei::{Callsite, RpcType};
use crate::faults::Fault;
use crate::transformer::Transformer;
use indexmap::IndexMap;
use log::info;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Status codes injected on every gRPC method by the default configuration.
pub const DEFAULT_GRPC_CODES: [&str; 5] = [
    "UNIMPLEMENTED",
    "INTERNAL",
    "UNAVAILABLE",
    "DEADLINE_EXCEEDED",
    "UNKNOWN",
];

/// HTTP statuses returned by the default configuration for web clients.
pub const DEFAULT_HTTP_STATUSES: [&str; 3] = ["500", "502", "503"];

/// Errors in an analysis configuration.  Always fatal to the test run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration {configuration:?} has no call-site pattern")]
    MissingPattern { configuration: String },

    #[error("configuration {configuration:?}: invalid pattern {pattern:?}")]
    InvalidPattern {
        configuration: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("configuration {0:?} declared twice")]
    DuplicateConfiguration(String),

    #[error("invalid exploration policy: {0}")]
    InvalidPolicy(String),
}

/// Errors loading or saving an analysis configuration file.
#[derive(Debug, Snafu)]
pub enum AnalysisFileError {
    #[snafu(display("I/O error: {source}"), context(false))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error: {source}"), context(false))]
    Json { source: serde_json::Error },

    #[snafu(display("invalid analysis configuration: {source}"), context(false))]
    Invalid { source: ConfigError },
}

// ── Policy ──────────────────────────────────────────────────────────

/// Order in which queued executions are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Oldest queued execution first.
    #[default]
    BreadthFirst,
    /// Newest queued execution first.
    DepthFirst,
}

/// Bounds on the fault-space search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationPolicy {
    pub strategy: SearchStrategy,
    /// Extend each explored assignment with further faults instead of
    /// proposing single-fault executions only.
    pub combinatorial: bool,
    /// Largest assignment proposed under `combinatorial` (`None` = unbounded).
    pub max_faults_per_execution: Option<usize>,
    /// Cap on executions ever scheduled for one test (`None` = unbounded).
    pub max_executions: Option<usize>,
    /// Wall-clock budget for one execution.
    pub execution_timeout_ms: Option<u64>,
    /// Skip clean faults at calls that already failed the same way on their own.
    pub avoid_redundant_injections: bool,
}

impl Default for ExplorationPolicy {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::BreadthFirst,
            combinatorial: false,
            max_faults_per_execution: None,
            max_executions: None,
            execution_timeout_ms: None,
            avoid_redundant_injections: true,
        }
    }
}

impl ExplorationPolicy {
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    /// Largest number of faults a proposed assignment may carry.
    pub fn fault_limit(&self) -> usize {
        if self.combinatorial {
            self.max_faults_per_execution.unwrap_or(usize::MAX)
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_faults_per_execution == Some(0) {
            return Err(ConfigError::InvalidPolicy(
                "max_faults_per_execution must be at least 1".to_string(),
            ));
        }
        if self.max_executions == Some(0) {
            return Err(ConfigError::InvalidPolicy(
                "max_executions must be at least 1".to_string(),
            ));
        }
        if self.execution_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidPolicy(
                "execution_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Serializable form ───────────────────────────────────────────────

/// An error to raise: exception type or error response plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorType {
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Errors that apply only to services matching `service_pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceErrors {
    pub service_pattern: String,
    pub types: Vec<ErrorType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByzantineRule {
    pub transformer: Transformer,
    #[serde(default)]
    pub seed: u64,
}

/// One analysis configuration as written in a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableAnalysisConfiguration {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_type: Option<RpcType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<ErrorType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ServiceErrors>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub latencies: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub byzantines: Vec<ByzantineRule>,
}

/// A whole analysis configuration file as written on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableAnalysisFile {
    #[serde(default)]
    pub policy: ExplorationPolicy,
    pub analysis: IndexMap<String, SerializableAnalysisConfiguration>,
}

// ── Compiled configuration ──────────────────────────────────────────

/// A named call-site matcher with its candidate faults.
#[derive(Debug, Clone)]
pub struct AnalysisConfiguration {
    name: String,
    pattern: Regex,
    service_errors: Vec<(Regex, Vec<Fault>)>,
    candidates: Vec<Fault>,
    source: SerializableAnalysisConfiguration,
}

impl AnalysisConfiguration {
    pub fn builder(name: impl Into<String>) -> AnalysisConfigurationBuilder {
        AnalysisConfigurationBuilder::new(name)
    }

    /// Compile a configuration read from a file.
    pub fn from_serializable(
        name: impl Into<String>,
        source: SerializableAnalysisConfiguration,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if source.pattern.is_empty() {
            return Err(ConfigError::MissingPattern { configuration: name });
        }
        let pattern = compile(&name, &source.pattern)?;

        let mut service_errors = Vec::with_capacity(source.errors.len());
        for rule in &source.errors {
            let matcher = compile(&name, &rule.service_pattern)?;
            let faults = rule.types.iter().map(error_fault).collect();
            service_errors.push((matcher, faults));
        }

        // Order: exceptions, latencies, byzantines.  Service-scoped errors
        // are appended per call site.
        let mut candidates: Vec<Fault> = source.exceptions.iter().map(error_fault).collect();
        candidates.extend(source.latencies.iter().map(|ms| Fault::latency(*ms)));
        candidates.extend(
            source
                .byzantines
                .iter()
                .map(|rule| Fault::byzantine(rule.transformer, rule.seed)),
        );

        Ok(Self {
            name,
            pattern,
            service_errors,
            candidates,
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn to_serializable(&self) -> SerializableAnalysisConfiguration {
        self.source.clone()
    }

    /// Whether calls from `callsite` fall under this configuration.
    pub fn matches(&self, callsite: &Callsite) -> bool {
        if let Some(rpc_type) = self.source.rpc_type {
            if rpc_type != callsite.rpc_type() {
                return false;
            }
        }
        self.pattern.is_match(&callsite.rpc_method())
    }

    /// Candidate faults for `callsite`, in declaration order.
    pub fn candidate_faults(&self, callsite: &Callsite) -> Vec<Fault> {
        if !self.matches(callsite) {
            return Vec::new();
        }
        let mut faults = self.candidates.clone();
        for (service, errors) in &self.service_errors {
            if service.is_match(callsite.service()) {
                faults.extend(errors.iter().cloned());
            }
        }
        faults
    }
}

fn compile(configuration: &str, pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::InvalidPattern {
            configuration: configuration.to_string(),
            pattern: pattern.to_string(),
            source,
        })
}

fn error_fault(error: &ErrorType) -> Fault {
    Fault::Error {
        name: error.name.clone(),
        metadata: error.metadata.clone(),
    }
}

/// Builder for [`AnalysisConfiguration`].
///
/// ```
/// use faultsweep_fault::config::AnalysisConfiguration;
/// use faultsweep_fault::dei::RpcType;
///
/// let config = AnalysisConfiguration::builder("grpc.unavailable")
///     .pattern("(.*/.*)")
///     .rpc_type(RpcType::Grpc)
///     .exception("io.grpc.StatusRuntimeException", [("code", "UNAVAILABLE")])
///     .latency(100)
///     .build()
///     .unwrap();
/// assert_eq!(config.name(), "grpc.unavailable");
/// ```
#[derive(Debug, Clone)]
pub struct AnalysisConfigurationBuilder {
    name: String,
    source: SerializableAnalysisConfiguration,
}

impl AnalysisConfigurationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: SerializableAnalysisConfiguration::default(),
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.source.pattern = pattern.into();
        self
    }

    pub fn rpc_type(mut self, rpc_type: RpcType) -> Self {
        self.source.rpc_type = Some(rpc_type);
        self
    }

    pub fn exception<K, V>(
        mut self,
        name: impl Into<String>,
        metadata: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.source.exceptions.push(error_type(name, metadata));
        self
    }

    /// Errors raised only for services matching `service_pattern`.
    pub fn error(mut self, service_pattern: impl Into<String>, types: Vec<ErrorType>) -> Self {
        self.source.errors.push(ServiceErrors {
            service_pattern: service_pattern.into(),
            types,
        });
        self
    }

    pub fn latency(mut self, milliseconds: u64) -> Self {
        self.source.latencies.push(milliseconds);
        self
    }

    pub fn byzantine(mut self, transformer: Transformer, seed: u64) -> Self {
        self.source.byzantines.push(ByzantineRule { transformer, seed });
        self
    }

    pub fn build(self) -> Result<AnalysisConfiguration, ConfigError> {
        AnalysisConfiguration::from_serializable(self.name, self.source)
    }
}

/// Build an [`ErrorType`] from a name and metadata pairs.
pub fn error_type<K, V>(name: impl Into<String>, metadata: impl IntoIterator<Item = (K, V)>) -> ErrorType
where
    K: Into<String>,
    V: Into<String>,
{
    ErrorType {
        name: name.into(),
        metadata: metadata
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect(),
    }
}

// ── Configuration file ──────────────────────────────────────────────

/// Named analysis configurations plus the exploration policy for a test.
#[derive(Debug, Clone, Default)]
pub struct AnalysisConfigurationFile {
    policy: ExplorationPolicy,
    configurations: IndexMap<String, AnalysisConfiguration>,
}

impl AnalysisConfigurationFile {
    pub fn new(policy: ExplorationPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self {
            policy,
            configurations: IndexMap::new(),
        })
    }

    /// Add a configuration; names must be unique.
    pub fn add(&mut self, configuration: AnalysisConfiguration) -> Result<(), ConfigError> {
        if self.configurations.contains_key(configuration.name()) {
            return Err(ConfigError::DuplicateConfiguration(
                configuration.name().to_string(),
            ));
        }
        self.configurations
            .insert(configuration.name().to_string(), configuration);
        Ok(())
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, configuration: AnalysisConfiguration) -> Result<Self, ConfigError> {
        self.add(configuration)?;
        Ok(self)
    }

    pub fn policy(&self) -> &ExplorationPolicy {
        &self.policy
    }

    pub fn configurations(&self) -> impl Iterator<Item = &AnalysisConfiguration> {
        self.configurations.values()
    }

    pub fn get(&self, name: &str) -> Option<&AnalysisConfiguration> {
        self.configurations.get(name)
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }

    /// Candidate faults from every matching configuration, first
    /// declaration wins on duplicates.
    pub fn candidate_faults(&self, callsite: &Callsite) -> Vec<Fault> {
        let mut faults: Vec<Fault> = Vec::new();
        for configuration in self.configurations.values() {
            for fault in configuration.candidate_faults(callsite) {
                if !faults.contains(&fault) {
                    faults.push(fault);
                }
            }
        }
        faults
    }

    pub fn from_serializable(file: SerializableAnalysisFile) -> Result<Self, ConfigError> {
        let mut compiled = Self::new(file.policy)?;
        for (name, source) in file.analysis {
            compiled.add(AnalysisConfiguration::from_serializable(name, source)?)?;
        }
        Ok(compiled)
    }

    pub fn to_serializable(&self) -> SerializableAnalysisFile {
        SerializableAnalysisFile {
            policy: self.policy.clone(),
            analysis: self
                .configurations
                .iter()
                .map(|(name, configuration)| (name.clone(), configuration.to_serializable()))
                .collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, AnalysisFileError> {
        let file: SerializableAnalysisFile = serde_json::from_str(json)?;
        Ok(Self::from_serializable(file)?)
    }

    /// Load a configuration file from JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AnalysisFileError> {
        let json = fs::read_to_string(path.as_ref())?;
        let file = Self::from_json(&json)?;
        info!(
            "Loaded {} analysis configurations from {}",
            file.len(),
            path.as_ref().display()
        );
        Ok(file)
    }

    /// Save this configuration file as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), AnalysisFileError> {
        let json = serde_json::to_string_pretty(&self.to_serializable())?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Default configuration: common gRPC status codes on every gRPC
    /// method and 5xx responses on web-client calls.
    pub fn grpc_default() -> Result<Self, ConfigError> {
        let mut exceptions = AnalysisConfiguration::builder("grpc.exceptions")
            .pattern("(.*/.*)")
            .rpc_type(RpcType::Grpc);
        for code in DEFAULT_GRPC_CODES {
            exceptions = exceptions.exception(
                "io.grpc.StatusRuntimeException",
                [("cause", ""), ("code", code)],
            );
        }

        let http_errors = DEFAULT_HTTP_STATUSES
            .iter()
            .map(|status| error_type("http.ErrorResponse", [("status_code", *status)]))
            .collect();
        let web_client = AnalysisConfiguration::builder("http.web_client")
            .pattern(r"WebClient\.(GET|PUT|POST|HEAD)")
            .rpc_type(RpcType::Http)
            .exception(
                "UnprocessedRequestException",
                [("cause", "ConnectTimeoutException"), ("code", "")],
            )
            .exception("ResponseTimeoutException", [("cause", ""), ("code", "")])
            .error(".*", http_errors);

        Self::new(ExplorationPolicy::default())?
            .with(exceptions.build()?)?
            .with(web_client.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn grpc_callsite(service: &str, method: &str) -> Callsite {
        Callsite::new(service, "hello.Greeter", method, ["hello.Request"]).unwrap()
    }

    #[test]
    fn test_pattern_is_case_insensitive_find() {
        let config = AnalysisConfiguration::builder("greeter")
            .pattern("greeter/hello")
            .exception("Boom", [("code", "INTERNAL")])
            .build()
            .unwrap();
        assert!(config.matches(&grpc_callsite("api", "Hello")));
        assert!(config.matches(&grpc_callsite("api", "HelloAgain")));
        assert!(!config.matches(&grpc_callsite("api", "Goodbye")));
        assert_eq!(config.candidate_faults(&grpc_callsite("api", "Hello")).len(), 1);
        assert!(config.candidate_faults(&grpc_callsite("api", "Goodbye")).is_empty());
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = AnalysisConfiguration::builder("broken")
            .pattern("(unclosed")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));

        let err = AnalysisConfiguration::builder("empty").build().unwrap_err();
        assert!(matches!(err, ConfigError::MissingPattern { .. }));
    }

    #[test]
    fn test_rpc_type_filter() {
        let config = AnalysisConfiguration::builder("http-only")
            .pattern(".*")
            .rpc_type(RpcType::Http)
            .latency(10)
            .build()
            .unwrap();
        assert!(!config.matches(&grpc_callsite("api", "Hello")));
        let http = Callsite::new("api", "WebClient", "GET", Vec::<String>::new())
            .unwrap()
            .with_rpc_type(RpcType::Http);
        assert_eq!(config.candidate_faults(&http), vec![Fault::latency(10)]);
    }

    #[test]
    fn test_service_scoped_errors() {
        let config = AnalysisConfiguration::builder("scoped")
            .pattern(".*")
            .error("^billing$", vec![error_type("PaymentDeclined", [("code", "402")])])
            .build()
            .unwrap();
        assert_eq!(config.candidate_faults(&grpc_callsite("billing", "Hello")).len(), 1);
        assert!(config.candidate_faults(&grpc_callsite("users", "Hello")).is_empty());
    }

    #[test]
    fn test_candidate_order_and_dedup() {
        let a = AnalysisConfiguration::builder("a")
            .pattern(".*")
            .exception("E", [("code", "X")])
            .latency(5)
            .byzantine(Transformer::BitFlip, 9)
            .build()
            .unwrap();
        let b = AnalysisConfiguration::builder("b")
            .pattern(".*")
            .latency(5)
            .latency(50)
            .build()
            .unwrap();
        let file = AnalysisConfigurationFile::new(ExplorationPolicy::default())
            .unwrap()
            .with(a)
            .unwrap()
            .with(b)
            .unwrap();
        assert_eq!(
            file.candidate_faults(&grpc_callsite("api", "Hello")),
            vec![
                Fault::error("E", [("code", "X")]),
                Fault::latency(5),
                Fault::byzantine(Transformer::BitFlip, 9),
                Fault::latency(50),
            ]
        );
    }

    #[test]
    fn test_duplicate_configuration_name() {
        let make = || {
            AnalysisConfiguration::builder("same")
                .pattern(".*")
                .build()
                .unwrap()
        };
        let mut file = AnalysisConfigurationFile::default();
        file.add(make()).unwrap();
        assert!(matches!(
            file.add(make()),
            Err(ConfigError::DuplicateConfiguration(name)) if name == "same"
        ));
    }

    #[test]
    fn test_policy_validation() {
        let policy = ExplorationPolicy {
            max_faults_per_execution: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            AnalysisConfigurationFile::new(policy),
            Err(ConfigError::InvalidPolicy(_))
        ));
        assert_eq!(ExplorationPolicy::default().fault_limit(), 1);
        let combinatorial = ExplorationPolicy {
            combinatorial: true,
            max_faults_per_execution: Some(3),
            ..Default::default()
        };
        assert_eq!(combinatorial.fault_limit(), 3);
    }

    #[test]
    fn test_grpc_default() {
        let file = AnalysisConfigurationFile::grpc_default().unwrap();
        let faults = file.candidate_faults(&grpc_callsite("api", "Hello"));
        let codes: Vec<_> = faults.iter().filter_map(Fault::code).collect();
        assert_eq!(codes, DEFAULT_GRPC_CODES.to_vec());

        let web = Callsite::new("api", "WebClient", "POST", Vec::<String>::new())
            .unwrap()
            .with_rpc_type(RpcType::Http);
        assert_eq!(file.candidate_faults(&web).len(), 5);
    }

    #[test]
    fn test_from_json_with_defaults() {
        let json = r#"{
            "analysis": {
                "only": { "pattern": "Hello", "latencies": [25] }
            }
        }"#;
        let file = AnalysisConfigurationFile::from_json(json).unwrap();
        assert_eq!(file.policy(), &ExplorationPolicy::default());
        assert_eq!(
            file.candidate_faults(&grpc_callsite("api", "Hello")),
            vec![Fault::latency(25)]
        );

        let bad = r#"{ "analysis": { "bad": { "pattern": "[" } } }"#;
        assert!(matches!(
            AnalysisConfigurationFile::from_json(bad),
            Err(AnalysisFileError::Invalid { .. })
        ));
        assert!(matches!(
            AnalysisConfigurationFile::from_json("{"),
            Err(AnalysisFileError::Json { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("analysis.json");

        let file = AnalysisConfigurationFile::grpc_default().unwrap();
        file.save(&path).unwrap();
        let loaded = AnalysisConfigurationFile::load(&path).unwrap();
        assert_eq!(loaded.to_serializable(), file.to_serializable());
        assert_eq!(
            loaded.configurations().map(|c| c.name()).collect::<Vec<_>>(),
            vec!["grpc.exceptions", "http.web_client"]
        );
    }

    #[test]
    fn test_load_not_found() {
        let result = AnalysisConfigurationFile::load("/nonexistent/analysis.json");
        assert!(matches!(result, Err(AnalysisFileError::Io { .. })));
    }
}
