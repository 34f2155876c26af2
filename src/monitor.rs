use crate::archive::{Archive, Solution};
use serde::{Deserialize, Serialize};
use std::error::Error;

/// One sampled point of the search trajectory
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct TrajectoryRow {
    pub evaluations: u64,
    pub reached_targets: usize,
    pub covered_targets: usize,
    pub improvements: u64,
    pub phase: String,
}

/// Read-only observer of the search. All data it holds are defensive copies
/// taken between iterations; it never keeps references into the live archive.
pub struct SearchMonitor {
    interval: u64,
    rows: Vec<TrajectoryRow>,
    improvements: u64,
    evaluations: u64,
}

impl SearchMonitor {
    pub fn new(interval: u64) -> SearchMonitor {
        SearchMonitor {
            interval,
            rows: Vec::new(),
            improvements: 0,
            evaluations: 0,
        }
    }

    /// Called by the loop after each archive update
    pub fn record(&mut self, evaluations: u64, archive: &Archive, added: bool, phase: &str) {
        self.evaluations = evaluations;
        if added {
            self.improvements += 1;
        }
        if self.interval > 0 && evaluations % self.interval == 0 {
            self.rows.push(TrajectoryRow {
                evaluations,
                reached_targets: archive.number_of_reached_targets(),
                covered_targets: archive.number_of_covered_targets(),
                improvements: self.improvements,
                phase: phase.to_string(),
            });
        }
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn improvements(&self) -> u64 {
        self.improvements
    }

    pub fn rows(&self) -> &[TrajectoryRow] {
        &self.rows
    }

    /// Write the trajectory as CSV
    pub fn export_trajectory<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["evaluations", "reached", "covered", "improvements", "phase"])?;
        for row in &self.rows {
            writer.write_record([
                row.evaluations.to_string(),
                row.reached_targets.to_string(),
                row.covered_targets.to_string(),
                row.improvements.to_string(),
                row.phase.clone(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Write per-gene impact statistics of every individual of a solution as CSV
pub fn export_impacts<P: AsRef<std::path::Path>>(
    solution: &Solution,
    path: P,
) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "test",
        "element",
        "times_to_manipulate",
        "times_of_no_impact",
        "times_of_impact",
        "no_impact_from_impact",
        "no_improvement",
    ])?;
    for (index, ei) in solution.individuals.iter().enumerate() {
        for (id, counters) in ei.impacts.flat_view() {
            writer.write_record([
                index.to_string(),
                id,
                counters.times_to_manipulate.to_string(),
                counters.times_of_no_impact.to_string(),
                join_map(&counters.times_of_impact),
                join_map(&counters.no_impact_from_impact),
                join_map(&counters.no_improvement),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn join_map(map: &std::collections::BTreeMap<u32, u32>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}->{}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}
