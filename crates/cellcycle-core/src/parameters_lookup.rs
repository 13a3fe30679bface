use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, StructureError};

/// Project name and sequence number encoded in a run's file name, e.g.
/// `PredictionDiagnostics_000109_tztest.010` → (`PredictionDiagnostics`, 109).
pub fn project_sequence(path: impl AsRef<Path>) -> Option<(String, u32)> {
    let stem = path.as_ref().file_stem()?.to_str()?;
    let mut parts = stem.split('_');
    let project = parts.next().filter(|p| !p.is_empty())?;
    let seq_num = parts.next()?.trim().parse::<u32>().ok()?;
    Some((project.to_string(), seq_num))
}

fn parse_number(value: Option<&String>) -> Option<f64> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn parse_count(value: Option<&String>) -> Option<i32> {
    parse_number(value)
        .filter(|v| v.fract() == 0.0 && *v >= 0.0)
        .map(|v| v as i32)
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// One row of a project's protocol parameter sheet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProtocolParameters {
    pub project: String,
    pub seq_num: u32,
    pub fields: BTreeMap<String, String>,
}

impl ProtocolParameters {
    pub fn new(project: impl Into<String>, seq_num: u32) -> Self {
        Self {
            project: project.into(),
            seq_num,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        non_empty(self.fields.get(key))
    }

    pub fn diagnostic_type(&self) -> Option<&str> {
        self.get("diagnostic_type")
    }

    pub fn diagnostic_parameter_set(&self) -> Option<&str> {
        self.get("diagnostic_parameter_set")
    }

    pub fn cell_type(&self) -> Option<&str> {
        self.get("cell_type")
    }

    pub fn capacity_nominal(&self) -> Option<f64> {
        parse_number(self.fields.get("capacity_nominal")).filter(|v| *v > 0.0)
    }

    pub fn discharge_cutoff_voltage(&self) -> Option<f64> {
        parse_number(self.fields.get("discharge_cutoff_voltage"))
    }

    pub fn charge_cutoff_voltage(&self) -> Option<f64> {
        parse_number(self.fields.get("charge_cutoff_voltage"))
    }

    pub fn diagnostic_start_cycle(&self) -> Option<i32> {
        parse_count(self.fields.get("diagnostic_start_cycle"))
    }

    pub fn diagnostic_interval(&self) -> Option<i32> {
        parse_count(self.fields.get("diagnostic_interval"))
    }
}

/// Cutoffs for one diagnostic parameter set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiagnosticTemplate {
    pub parameter_set: String,
    pub fields: BTreeMap<String, String>,
}

impl DiagnosticTemplate {
    pub fn new(parameter_set: impl Into<String>) -> Self {
        Self {
            parameter_set: parameter_set.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn discharge_cutoff_voltage(&self) -> Option<f64> {
        parse_number(self.fields.get("diagnostic_discharge_cutoff_voltage"))
    }

    pub fn charge_cutoff_voltage(&self) -> Option<f64> {
        parse_number(self.fields.get("diagnostic_charge_cutoff_voltage"))
    }
}

/// `[discharge_cutoff, charge_cutoff]` of a template, when both are set.
pub fn diagnostic_v_range(template: &DiagnosticTemplate) -> Option<[f64; 2]> {
    match (
        template.discharge_cutoff_voltage(),
        template.charge_cutoff_voltage(),
    ) {
        (Some(low), Some(high)) if low < high => Some([low, high]),
        _ => None,
    }
}

/// Read-only source of protocol rows and diagnostic templates.
pub trait ParameterLookup {
    fn protocol_parameters(&self, project: &str, seq_num: u32)
        -> Result<Option<ProtocolParameters>>;

    fn diagnostic_template(
        &self,
        project: &str,
        parameter_set: &str,
    ) -> Result<Option<DiagnosticTemplate>>;
}

/// Protocol row for a run, or `MissingParameterLookup` when no sheet has one.
pub fn require_protocol_parameters(
    lookup: &dyn ParameterLookup,
    project: &str,
    seq_num: u32,
) -> Result<ProtocolParameters> {
    lookup
        .protocol_parameters(project, seq_num)?
        .ok_or_else(|| StructureError::MissingParameterLookup {
            project: project.to_string(),
            seq_num,
        })
}

/// Parameter sheets stored as `<project>*.csv` files.
#[derive(Debug, Clone)]
pub struct CsvParameterLookup {
    pub parameters_dir: PathBuf,
    pub templates_dir: PathBuf,
}

impl CsvParameterLookup {
    pub fn new(parameters_dir: impl Into<PathBuf>, templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            parameters_dir: parameters_dir.into(),
            templates_dir: templates_dir.into(),
        }
    }

    fn project_files(dir: &Path, project: &str) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = dir.join(format!("{}*.csv", glob::Pattern::escape(project)));
        let mut files = Vec::new();
        for entry in glob::glob(&pattern.to_string_lossy())? {
            files.push(entry.map_err(|err| StructureError::Io(err.into()))?);
        }
        files.sort();
        Ok(files)
    }

    fn read_rows(path: &Path) -> Result<Vec<HashMap<String, String>>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let headers = reader.headers()?.clone();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                headers
                    .iter()
                    .zip(record.iter())
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            );
        }
        Ok(rows)
    }
}

impl ParameterLookup for CsvParameterLookup {
    fn protocol_parameters(
        &self,
        project: &str,
        seq_num: u32,
    ) -> Result<Option<ProtocolParameters>> {
        for path in Self::project_files(&self.parameters_dir, project)? {
            debug!(path = %path.display(), project, seq_num, "scanning parameter sheet");
            for row in Self::read_rows(&path)? {
                let matches = parse_number(row.get("seq_num"))
                    .map(|value| value == f64::from(seq_num))
                    .unwrap_or(false);
                if matches {
                    return Ok(Some(ProtocolParameters {
                        project: project.to_string(),
                        seq_num,
                        fields: row.into_iter().collect(),
                    }));
                }
            }
        }
        Ok(None)
    }

    fn diagnostic_template(
        &self,
        project: &str,
        parameter_set: &str,
    ) -> Result<Option<DiagnosticTemplate>> {
        for path in Self::project_files(&self.templates_dir, project)? {
            for row in Self::read_rows(&path)? {
                if non_empty(row.get("diagnostic_parameter_set")) == Some(parameter_set) {
                    return Ok(Some(DiagnosticTemplate {
                        parameter_set: parameter_set.to_string(),
                        fields: row.into_iter().collect(),
                    }));
                }
            }
        }
        Ok(None)
    }
}

/// In-memory lookup, keyed the same way as the CSV sheets.
#[derive(Debug, Clone, Default)]
pub struct StaticParameterLookup {
    protocols: Vec<ProtocolParameters>,
    templates: Vec<(String, DiagnosticTemplate)>,
}

impl StaticParameterLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, row: ProtocolParameters) -> Self {
        self.protocols.push(row);
        self
    }

    pub fn with_template(mut self, project: impl Into<String>, template: DiagnosticTemplate) -> Self {
        self.templates.push((project.into(), template));
        self
    }
}

impl ParameterLookup for StaticParameterLookup {
    fn protocol_parameters(
        &self,
        project: &str,
        seq_num: u32,
    ) -> Result<Option<ProtocolParameters>> {
        Ok(self
            .protocols
            .iter()
            .find(|row| row.project == project && row.seq_num == seq_num)
            .cloned())
    }

    fn diagnostic_template(
        &self,
        project: &str,
        parameter_set: &str,
    ) -> Result<Option<DiagnosticTemplate>> {
        Ok(self
            .templates
            .iter()
            .find(|(owner, template)| owner == project && template.parameter_set == parameter_set)
            .map(|(_, template)| template.clone()))
    }
}

/// Lookup that never matches; runs are structured as regular cycling only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoParameterLookup;

impl ParameterLookup for NoParameterLookup {
    fn protocol_parameters(&self, _: &str, _: u32) -> Result<Option<ProtocolParameters>> {
        Ok(None)
    }

    fn diagnostic_template(&self, _: &str, _: &str) -> Result<Option<DiagnosticTemplate>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn project_and_sequence_come_from_the_stem() {
        assert_eq!(
            project_sequence("/data/PredictionDiagnostics_000109_tztest.010"),
            Some(("PredictionDiagnostics".to_string(), 109))
        );
        assert_eq!(project_sequence("cell_a.csv"), None);
        assert_eq!(project_sequence("noseparator.csv"), None);
    }

    #[test]
    fn csv_lookup_matches_sequence_and_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = dir.path().join("parameters");
        let templates = dir.path().join("templates");
        fs::create_dir_all(&params).expect("mkdir");
        fs::create_dir_all(&templates).expect("mkdir");
        fs::write(
            params.join("PredictionDiagnostics_parameters - GP.csv"),
            "seq_num,project_name,capacity_nominal,diagnostic_type,diagnostic_parameter_set,cell_type\n\
             108,PredictionDiagnostics,4.84,HPPC+RPT,Tesla21700,Tesla_Model3_21700\n\
             109,PredictionDiagnostics,4.84,HPPC+RPT,Tesla21700,Tesla_Model3_21700\n",
        )
        .expect("write");
        fs::write(
            templates.join("PredictionDiagnostics_diagnostic.csv"),
            "diagnostic_parameter_set,diagnostic_discharge_cutoff_voltage,diagnostic_charge_cutoff_voltage\n\
             Tesla21700,2.5,4.2\n",
        )
        .expect("write");

        let lookup = CsvParameterLookup::new(&params, &templates);
        let row = lookup
            .protocol_parameters("PredictionDiagnostics", 109)
            .expect("lookup")
            .expect("row present");
        assert_eq!(row.capacity_nominal(), Some(4.84));
        assert_eq!(row.diagnostic_type(), Some("HPPC+RPT"));
        assert!(lookup
            .protocol_parameters("PredictionDiagnostics", 7)
            .expect("lookup")
            .is_none());

        let template = lookup
            .diagnostic_template("PredictionDiagnostics", "Tesla21700")
            .expect("lookup")
            .expect("template present");
        assert_eq!(diagnostic_v_range(&template), Some([2.5, 4.2]));
    }

    #[test]
    fn missing_directories_resolve_to_none() {
        let lookup = CsvParameterLookup::new("/nonexistent/params", "/nonexistent/templates");
        assert!(lookup.protocol_parameters("X", 1).expect("lookup").is_none());
    }
}
