use serde::{Deserialize, Serialize};

use crate::variant::Variant;

/// Outcome of a single executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    Undefined,
    Pending,
}

/// A scenario that failed, with the step that failed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedScenario {
    pub scenario_name: String,
    pub failing_step_text: String,
    /// `file:line` of the failing step.
    pub source_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Step counts and failures for one protocol variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantResults {
    pub variant: Variant,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub undefined: u64,
    pub pending: u64,
    pub failed_scenarios: Vec<FailedScenario>,
}

impl VariantResults {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            undefined: 0,
            pending: 0,
            failed_scenarios: Vec::new(),
        }
    }

    pub fn record_step(&mut self, status: StepStatus) {
        self.total += 1;
        match status {
            StepStatus::Passed => self.passed += 1,
            StepStatus::Failed => self.failed += 1,
            StepStatus::Skipped => self.skipped += 1,
            StepStatus::Undefined => self.undefined += 1,
            StepStatus::Pending => self.pending += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Running total across every variant of a suite run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteResults {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub undefined: u64,
    pub pending: u64,
    pub variants: Vec<String>,
    pub results_by_variant: Vec<VariantResults>,
}

impl SuiteResults {
    /// Folds one variant into the running total.
    pub fn fold(mut self, variant: VariantResults) -> Self {
        self.total += variant.total;
        self.passed += variant.passed;
        self.failed += variant.failed;
        self.skipped += variant.skipped;
        self.undefined += variant.undefined;
        self.pending += variant.pending;
        self.variants.push(variant.variant.name().to_string());
        self.results_by_variant.push(variant);
        self
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}
