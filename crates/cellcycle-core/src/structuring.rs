use std::collections::{BTreeMap, BTreeSet, HashMap};

use cellcycle_parser::{RawCyclerRun, RunMetadata};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StructuringConfig;
use crate::cycler_table::CyclerTable;
use crate::error::{Result, StructureError};
use crate::parameters_lookup::{
    diagnostic_v_range, project_sequence, require_protocol_parameters, ParameterLookup,
    ProtocolParameters,
};

/// Voltage windows of cell chemistries the parameter sheets refer to by name.
static CELL_TYPE_V_RANGE: Lazy<HashMap<&'static str, [f64; 2]>> = Lazy::new(|| {
    HashMap::from([
        ("Tesla_Model3_21700", [2.5, 4.2]),
        ("Panasonic_NCR18650B", [2.5, 4.2]),
    ])
});

pub const HPPC: &str = "hppc";
pub const RESET: &str = "reset";

/// Phase names of one diagnostic block for a protocol's `diagnostic_type`.
pub fn diagnostic_phases(diagnostic_type: &str) -> Option<Vec<String>> {
    let phases: &[&str] = match diagnostic_type.trim() {
        "HPPC+RPT" => &[RESET, HPPC, "rpt_0.2C", "rpt_1C", "rpt_2C"],
        "HPPC" => &[HPPC],
        "RPT" => &["rpt_0.2C", "rpt_1C", "rpt_2C"],
        _ => return None,
    };
    Some(phases.iter().map(|p| p.to_string()).collect())
}

/// Where diagnostic blocks sit in a run and what each of their cycles is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticAvailable {
    pub parameter_set: String,
    pub cycle_type: Vec<String>,
    pub length: usize,
    pub diagnostic_starts_at: Vec<i32>,
}

impl DiagnosticAvailable {
    /// Phase of `cycle_index` when it falls inside a block.
    pub fn cycle_type_of(&self, cycle_index: i32) -> Option<&str> {
        let start = self
            .diagnostic_starts_at
            .iter()
            .rev()
            .find(|start| **start <= cycle_index)?;
        let offset = usize::try_from(cycle_index - start).ok()?;
        if offset >= self.length {
            return None;
        }
        self.cycle_type.get(offset).map(String::as_str)
    }

    pub fn is_diagnostic(&self, cycle_index: i32) -> bool {
        self.cycle_type_of(cycle_index).is_some()
    }

    /// Every diagnostic cycle index with its phase, ascending.
    pub fn diagnostic_cycles(&self) -> Vec<(i32, &str)> {
        self.diagnostic_starts_at
            .iter()
            .flat_map(|start| {
                self.cycle_type
                    .iter()
                    .take(self.length)
                    .enumerate()
                    .map(move |(offset, phase)| (start + offset as i32, phase.as_str()))
            })
            .collect()
    }

    /// Distances between consecutive block starts.
    pub fn gaps(&self) -> Vec<i32> {
        self.diagnostic_starts_at
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    /// True when every gap after the first one is the same.
    pub fn is_periodic(&self) -> bool {
        let gaps = self.gaps();
        gaps.iter().skip(1).collect::<BTreeSet<_>>().len() <= 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuringParameters {
    pub v_range: [f64; 2],
    pub resolution: usize,
    pub diagnostic_resolution: usize,
    pub nominal_capacity: f64,
    pub full_fast_charge: f64,
    pub diagnostic_available: Option<DiagnosticAvailable>,
    pub diagnostic_v_range: Option<[f64; 2]>,
}

impl StructuringParameters {
    pub fn defaults(config: &StructuringConfig) -> Self {
        Self {
            v_range: config.v_range.unwrap_or(config.default_v_range),
            resolution: config.resolution,
            diagnostic_resolution: config.diagnostic_resolution,
            nominal_capacity: config.nominal_capacity,
            full_fast_charge: config.full_fast_charge,
            diagnostic_available: None,
            diagnostic_v_range: None,
        }
    }

    pub fn is_diagnostic(&self, cycle_index: i32) -> bool {
        self.diagnostic_available
            .as_ref()
            .map(|d| d.is_diagnostic(cycle_index))
            .unwrap_or(false)
    }

    /// Voltage window for reset/RPT cycles.
    pub fn diagnostic_window(&self) -> [f64; 2] {
        self.diagnostic_v_range.unwrap_or(self.v_range)
    }
}

fn protocol_v_range(row: &ProtocolParameters) -> Option<[f64; 2]> {
    if let (Some(low), Some(high)) = (row.discharge_cutoff_voltage(), row.charge_cutoff_voltage()) {
        if low < high {
            return Some([low, high]);
        }
    }
    row.cell_type()
        .and_then(|cell| CELL_TYPE_V_RANGE.get(cell).copied())
}

/// Block start cycles found by matching per-cycle step sets against the
/// first two blocks. Falls back to the periodic schedule when neither
/// reference cycle exists or both look like regular cycling.
pub fn locate_diagnostic_blocks(
    table: &CyclerTable,
    first: i32,
    start_cycle: i32,
    interval: i32,
    length: usize,
) -> Vec<i32> {
    let length = length as i32;
    let signatures: BTreeMap<i32, BTreeSet<i32>> = table
        .cycles()
        .iter()
        .map(|cycle| (cycle.cycle_index, table.step_set(cycle)))
        .collect();
    let Some(&last) = signatures.keys().next_back() else {
        return Vec::new();
    };
    if length == 0 {
        return Vec::new();
    }

    let second = first + start_cycle + length;
    let in_block = |cycle: i32, start: i32| cycle >= start && cycle < start + length;
    let regular = signatures
        .iter()
        .find(|(cycle, _)| !in_block(**cycle, first) && !in_block(**cycle, second))
        .map(|(_, signature)| signature);

    let mut references: Vec<&BTreeSet<i32>> = Vec::new();
    for reference in [first, second] {
        if let Some(signature) = signatures.get(&reference) {
            if Some(signature) != regular && !references.contains(&signature) {
                references.push(signature);
            }
        }
    }

    if references.is_empty() {
        debug!(first, start_cycle, interval, "no reference blocks, using periodic schedule");
        let mut starts = Vec::new();
        if first <= last {
            starts.push(first);
        }
        let step = (interval + length).max(1);
        let mut next = second;
        while next <= last {
            starts.push(next);
            next += step;
        }
        return starts;
    }

    let mut starts = Vec::new();
    let mut cursor = first;
    for (&cycle, signature) in signatures.range(first..) {
        if cycle < cursor {
            continue;
        }
        if references.contains(&signature) {
            starts.push(cycle);
            cursor = cycle + length;
        }
    }
    starts
}

/// Resolves structuring parameters for a run, reading the table from its frame.
pub fn determine_structuring_parameters(
    raw: &RawCyclerRun,
    lookup: &dyn ParameterLookup,
    config: &StructuringConfig,
) -> Result<StructuringParameters> {
    let table = CyclerTable::from_frame(raw.data())?;
    resolve_structuring_parameters(raw.metadata(), &table, lookup, config)
}

pub fn resolve_structuring_parameters(
    metadata: &RunMetadata,
    table: &CyclerTable,
    lookup: &dyn ParameterLookup,
    config: &StructuringConfig,
) -> Result<StructuringParameters> {
    config.validate()?;
    let mut params = StructuringParameters::defaults(config);

    let Some((project, seq_num)) = metadata.filename().and_then(project_sequence) else {
        debug!("file name carries no project/sequence, using defaults");
        return Ok(params);
    };
    let row = match require_protocol_parameters(lookup, &project, seq_num) {
        Ok(row) => row,
        Err(err @ StructureError::MissingParameterLookup { .. }) => {
            warn!(error = %err, "regular cycling only");
            return Ok(params);
        }
        Err(err) => return Err(err),
    };

    if let Some(nominal) = row.capacity_nominal() {
        params.nominal_capacity = nominal;
    }
    if config.v_range.is_none() {
        if let Some(v_range) = protocol_v_range(&row) {
            params.v_range = v_range;
        }
    }

    let (Some(diagnostic_type), Some(parameter_set)) =
        (row.diagnostic_type(), row.diagnostic_parameter_set())
    else {
        return Ok(params);
    };
    let Some(cycle_type) = diagnostic_phases(diagnostic_type) else {
        warn!(diagnostic_type, "unknown diagnostic type, diagnostics skipped");
        return Ok(params);
    };

    let length = cycle_type.len();
    let start_cycle = row
        .diagnostic_start_cycle()
        .unwrap_or(config.diagnostic_start_cycle);
    let interval = row
        .diagnostic_interval()
        .unwrap_or(config.diagnostic_interval);
    let starts = locate_diagnostic_blocks(
        table,
        config.diagnostic_first_cycle,
        start_cycle,
        interval,
        length,
    );

    let diagnostic = DiagnosticAvailable {
        parameter_set: parameter_set.to_string(),
        cycle_type,
        length,
        diagnostic_starts_at: starts,
    };
    if !diagnostic.is_periodic() {
        info!(gaps = ?diagnostic.gaps(), "diagnostic blocks are not evenly spaced");
    }

    params.diagnostic_v_range = lookup
        .diagnostic_template(&project, parameter_set)?
        .as_ref()
        .and_then(diagnostic_v_range);
    info!(
        project = %project,
        seq_num,
        parameter_set,
        blocks = diagnostic.diagnostic_starts_at.len(),
        "diagnostic blocks located"
    );
    params.diagnostic_available = Some(diagnostic);
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available(starts: Vec<i32>) -> DiagnosticAvailable {
        DiagnosticAvailable {
            parameter_set: "Tesla21700".to_string(),
            cycle_type: diagnostic_phases("HPPC+RPT").expect("known type"),
            length: 5,
            diagnostic_starts_at: starts,
        }
    }

    #[test]
    fn phases_map_from_diagnostic_type() {
        assert_eq!(
            diagnostic_phases("HPPC+RPT").expect("known"),
            vec!["reset", "hppc", "rpt_0.2C", "rpt_1C", "rpt_2C"]
        );
        assert_eq!(diagnostic_phases("HPPC").map(|p| p.len()), Some(1));
        assert!(diagnostic_phases("EIS").is_none());
    }

    #[test]
    fn cycle_types_follow_block_offsets() {
        let diagnostic = available(vec![1, 36, 141]);
        assert_eq!(diagnostic.cycle_type_of(1), Some("reset"));
        assert_eq!(diagnostic.cycle_type_of(37), Some("hppc"));
        assert_eq!(diagnostic.cycle_type_of(145), Some("rpt_2C"));
        assert_eq!(diagnostic.cycle_type_of(6), None);
        assert_eq!(diagnostic.cycle_type_of(0), None);
        assert_eq!(diagnostic.diagnostic_cycles().len(), 15);
        assert_eq!(diagnostic.gaps(), vec![35, 105]);
        assert!(diagnostic.is_periodic());
        assert!(!available(vec![1, 36, 141, 220, 255]).is_periodic());
    }
}
