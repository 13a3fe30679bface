use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StructureError};
use crate::interpolation::{Axis, InterpolationPolicy};
use crate::parameters_lookup::CsvParameterLookup;
use crate::step_classifier::ClassifierSettings;

pub const PROCESSING_DIR_ENV: &str = "CELLCYCLE_PROCESSING_DIR";

/// Knobs for turning a raw run into a processed run. Every field has a
/// default, so a TOML file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuringConfig {
    /// Forces the regular-cycle voltage range regardless of lookups.
    pub v_range: Option<[f64; 2]>,
    pub default_v_range: [f64; 2],
    pub resolution: usize,
    pub diagnostic_resolution: usize,
    pub nominal_capacity: f64,
    pub full_fast_charge: f64,
    /// Voltage tie tolerance (V).
    pub v_resolution: f64,
    pub min_interpolation_points: usize,
    pub policy: InterpolationPolicy,
    pub charge_axis: Axis,
    pub discharge_axis: Axis,
    /// Gaps in `test_time` above this many seconds flag a cycle as paused.
    pub paused_threshold: f64,
    pub classifier: ClassifierSettings,
    pub diagnostic_first_cycle: i32,
    pub diagnostic_start_cycle: i32,
    pub diagnostic_interval: i32,
}

impl Default for StructuringConfig {
    fn default() -> Self {
        Self {
            v_range: None,
            default_v_range: [2.8, 3.5],
            resolution: 1000,
            diagnostic_resolution: 1000,
            nominal_capacity: 1.1,
            full_fast_charge: 0.8,
            v_resolution: 0.0005,
            min_interpolation_points: 5,
            policy: InterpolationPolicy::FallbackCoarser { resolution: 100 },
            charge_axis: Axis::ChargeCapacity,
            discharge_axis: Axis::Voltage,
            paused_threshold: 3600.0,
            classifier: ClassifierSettings::default(),
            diagnostic_first_cycle: 1,
            diagnostic_start_cycle: 30,
            diagnostic_interval: 100,
        }
    }
}

impl StructuringConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects diagnostic schedule values that cannot describe a run.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("diagnostic_first_cycle", self.diagnostic_first_cycle),
            ("diagnostic_start_cycle", self.diagnostic_start_cycle),
            ("diagnostic_interval", self.diagnostic_interval),
        ] {
            if value < 0 {
                return Err(StructureError::InvalidConfig(format!(
                    "{name} must not be negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Where a batch reads parameters from and writes artifacts to.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub root: PathBuf,
    pub config: StructuringConfig,
}

impl ProcessingContext {
    pub fn new(root: impl Into<PathBuf>, config: StructuringConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Root from `CELLCYCLE_PROCESSING_DIR`, else `<tmp>/cellcycle`.
    pub fn from_env(config: StructuringConfig) -> Self {
        let root = env::var_os(PROCESSING_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("cellcycle"));
        Self::new(root, config)
    }

    pub fn parameters_dir(&self) -> PathBuf {
        self.root.join("data-share").join("raw").join("parameters")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root
            .join("data-share")
            .join("raw")
            .join("diagnostic_parameters")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("data-share").join("structure")
    }

    pub fn results_path(&self) -> PathBuf {
        self.root.join("results.json")
    }

    pub fn parameter_lookup(&self) -> CsvParameterLookup {
        CsvParameterLookup::new(self.parameters_dir(), self.templates_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = StructuringConfig::from_toml_str(
            r#"
            resolution = 250
            v_range = [2.7, 4.2]

            [policy]
            mode = "strict"

            [classifier]
            sign_change_tolerance = 4
            "#,
        )
        .expect("config parsed");

        assert_eq!(config.resolution, 250);
        assert_eq!(config.v_range, Some([2.7, 4.2]));
        assert_eq!(config.policy, InterpolationPolicy::Strict);
        assert_eq!(config.classifier.sign_change_tolerance, 4);
        assert_eq!(config.classifier.noise_fraction, 0.01);
        assert_eq!(config.default_v_range, [2.8, 3.5]);
        assert_eq!(config.paused_threshold, 3600.0);
    }

    #[test]
    fn context_derives_artifact_paths() {
        let ctx = ProcessingContext::new("/data/run", StructuringConfig::default());
        assert_eq!(
            ctx.output_dir(),
            PathBuf::from("/data/run/data-share/structure")
        );
        assert_eq!(ctx.results_path(), PathBuf::from("/data/run/results.json"));
    }
}
