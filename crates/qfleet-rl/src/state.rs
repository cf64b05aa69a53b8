//! State encoding: raw task context -> discretized features + fingerprint

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use qfleet_core::{FeatureValue, QFleetError, Result, StateFeatures, StateFingerprint};

use crate::registry::normalize_agent_kind;

/// Loosely-typed task context supplied by a caller
pub type Context = Map<String, Value>;

/// Well-known agent kinds with dedicated feature extractors
pub mod agent_kinds {
    pub const TEST_GENERATOR: &str = "test-generator";
    pub const COVERAGE_ANALYZER: &str = "coverage-analyzer";
    pub const FLAKY_TEST_HUNTER: &str = "flaky-test-hunter";
    pub const PERFORMANCE_TESTER: &str = "performance-tester";
}

/// Result of encoding one context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedState {
    pub fingerprint: StateFingerprint,
    pub features: StateFeatures,
}

/// Bucket a continuous value into a fixed-width integer bin
pub fn bucket(value: f64, width: f64) -> i64 {
    (value / width).floor() as i64
}

/// SHA-256 of the canonical feature serialization, lowercase hex
pub fn fingerprint(features: &StateFeatures) -> StateFingerprint {
    let digest = Sha256::digest(features.canonical_json().as_bytes());
    StateFingerprint::from_raw(format!("{digest:x}"))
}

/// Typed accessors over a raw context, carrying the agent kind for errors
pub struct ContextReader<'a> {
    agent_kind: &'a str,
    context: &'a Context,
}

impl<'a> ContextReader<'a> {
    pub fn new(agent_kind: &'a str, context: &'a Context) -> Self {
        Self { agent_kind, context }
    }

    /// Numeric field; numeric strings are accepted, non-finite values are not
    pub fn number(&self, key: &str) -> Option<f64> {
        let value = match self.context.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        value.is_finite().then_some(value)
    }

    pub fn require_number(&self, key: &str) -> Result<f64> {
        self.number(key).ok_or_else(|| {
            QFleetError::invalid_context(
                self.agent_kind,
                format!("missing numeric field '{key}'"),
            )
        })
    }

    /// Categorical field, trimmed and lower-cased; empty strings count as absent
    pub fn label(&self, key: &str) -> Option<String> {
        let raw = match self.context.get(key)? {
            Value::String(s) => s.trim().to_lowercase(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!raw.is_empty()).then_some(raw)
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.context.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn agent_kind(&self) -> &str {
        self.agent_kind
    }
}

/// Agent-kind specific feature extraction strategy
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, reader: &ContextReader<'_>) -> Result<StateFeatures>;
}

/// Complexity given either as 0..1 or 0..100, normalized to a percentage
fn complexity_percent(reader: &ContextReader<'_>) -> Option<f64> {
    reader
        .number("complexity")
        .map(|c| if c <= 1.0 { c * 100.0 } else { c })
}

/// test-generator: coverage gap, framework, complexity
pub struct TestGeneratorFeatures;

impl FeatureExtractor for TestGeneratorFeatures {
    fn extract(&self, reader: &ContextReader<'_>) -> Result<StateFeatures> {
        let gap = match reader.number("coverage_gap") {
            Some(gap) => gap,
            None => reader
                .number("coverage")
                .map(|coverage| 100.0 - coverage)
                .ok_or_else(|| {
                    QFleetError::invalid_context(
                        reader.agent_kind(),
                        "needs 'coverage_gap' or 'coverage'",
                    )
                })?,
        };

        Ok(StateFeatures::new()
            .with("coverage_gap", FeatureValue::Bucket(bucket(gap.clamp(0.0, 100.0), 10.0)))
            .with(
                "framework",
                FeatureValue::Label(reader.label("framework").unwrap_or_else(|| "unknown".into())),
            )
            .with(
                "complexity",
                FeatureValue::Bucket(bucket(complexity_percent(reader).unwrap_or(50.0), 10.0)),
            ))
    }
}

/// coverage-analyzer: current coverage, codebase size, language
pub struct CoverageAnalyzerFeatures;

impl FeatureExtractor for CoverageAnalyzerFeatures {
    fn extract(&self, reader: &ContextReader<'_>) -> Result<StateFeatures> {
        let coverage = reader.require_number("coverage")?;
        Ok(StateFeatures::new()
            .with("coverage", FeatureValue::Bucket(bucket(coverage.clamp(0.0, 100.0), 10.0)))
            .with(
                "file_count",
                FeatureValue::Bucket(bucket(reader.number("file_count").unwrap_or(0.0), 100.0)),
            )
            .with(
                "language",
                FeatureValue::Label(reader.label("language").unwrap_or_else(|| "unknown".into())),
            ))
    }
}

/// flaky-test-hunter: sample size, observed failure rate, framework
pub struct FlakyTestFeatures;

impl FeatureExtractor for FlakyTestFeatures {
    fn extract(&self, reader: &ContextReader<'_>) -> Result<StateFeatures> {
        let runs = reader.require_number("test_runs")?;
        let failure_rate = reader.number("failure_rate").unwrap_or(0.0);
        let failure_pct = if failure_rate <= 1.0 { failure_rate * 100.0 } else { failure_rate };

        Ok(StateFeatures::new()
            .with("test_runs", FeatureValue::Bucket(bucket(runs.max(0.0), 100.0)))
            .with("failure_rate", FeatureValue::Bucket(bucket(failure_pct.clamp(0.0, 100.0), 10.0)))
            .with(
                "framework",
                FeatureValue::Label(reader.label("framework").unwrap_or_else(|| "unknown".into())),
            ))
    }
}

/// performance-tester: tail latency and load profile
pub struct PerformanceTestFeatures;

impl FeatureExtractor for PerformanceTestFeatures {
    fn extract(&self, reader: &ContextReader<'_>) -> Result<StateFeatures> {
        let p95 = reader.require_number("p95_latency_ms")?;
        Ok(StateFeatures::new()
            .with("p95_latency_ms", FeatureValue::Bucket(bucket(p95.max(0.0), 100.0)))
            .with(
                "load_profile",
                FeatureValue::Label(reader.label("load_profile").unwrap_or_else(|| "steady".into())),
            ))
    }
}

/// Fallback for unknown agent kinds; never fails
pub struct GenericFeatures;

impl FeatureExtractor for GenericFeatures {
    fn extract(&self, reader: &ContextReader<'_>) -> Result<StateFeatures> {
        Ok(StateFeatures::new()
            .with(
                "task_type",
                FeatureValue::Label(reader.label("task_type").unwrap_or_else(|| "unknown".into())),
            )
            .with(
                "complexity",
                FeatureValue::Bucket(bucket(complexity_percent(reader).unwrap_or(50.0), 25.0)),
            ))
    }
}

/// Maps agent kinds to feature extractors and fingerprints the result
pub struct StateEncoder {
    extractors: HashMap<String, Arc<dyn FeatureExtractor>>,
    fallback: Arc<dyn FeatureExtractor>,
}

impl StateEncoder {
    /// Encoder with the built-in extractors registered
    pub fn new() -> Self {
        Self::empty()
            .register(agent_kinds::TEST_GENERATOR, TestGeneratorFeatures)
            .register(agent_kinds::COVERAGE_ANALYZER, CoverageAnalyzerFeatures)
            .register(agent_kinds::FLAKY_TEST_HUNTER, FlakyTestFeatures)
            .register(agent_kinds::PERFORMANCE_TESTER, PerformanceTestFeatures)
    }

    /// Encoder where every agent kind uses the generic features
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
            fallback: Arc::new(GenericFeatures),
        }
    }

    pub fn register(mut self, agent_kind: &str, extractor: impl FeatureExtractor + 'static) -> Self {
        self.extractors
            .insert(normalize_agent_kind(agent_kind), Arc::new(extractor));
        self
    }

    pub fn is_known(&self, agent_kind: &str) -> bool {
        self.extractors.contains_key(&normalize_agent_kind(agent_kind))
    }

    /// Encode a context. Non-object contexts are treated as empty.
    pub fn encode(&self, agent_kind: &str, context: &Value) -> Result<EncodedState> {
        let empty = Map::new();
        let context = context.as_object().unwrap_or(&empty);
        self.encode_map(agent_kind, context)
    }

    pub fn encode_map(&self, agent_kind: &str, context: &Context) -> Result<EncodedState> {
        let extractor = self
            .extractors
            .get(&normalize_agent_kind(agent_kind))
            .unwrap_or(&self.fallback);

        let features = extractor.extract(&ContextReader::new(agent_kind, context))?;
        Ok(EncodedState {
            fingerprint: fingerprint(&features),
            features,
        })
    }
}

impl Default for StateEncoder {
    fn default() -> Self {
        Self::new()
    }
}
