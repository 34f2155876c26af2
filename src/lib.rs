pub mod archive;
pub mod benchmark;
pub mod eval;
pub mod fitness;
pub mod gene;
pub mod impact;
pub mod individual;
pub mod mio;
pub mod monitor;
pub mod mutator;
pub mod param;
pub mod utils;

use crate::archive::Solution;
use crate::eval::{FitnessFunction, ResponseHarvester, Sampler};
use crate::mio::mio;
use crate::monitor::SearchMonitor;
use crate::param::Param;
use chrono::Local;
use log::{error, info};
use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Full crate version including the git revision when available
pub fn version() -> String {
    match option_env!("MIOSEARCH_GIT_SHA") {
        Some(sha) => format!("{}#{}", env!("CARGO_PKG_VERSION"), sha),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Run one full search against the given collaborators and hand back the
/// extracted solution, saving it and the statistics exports when configured.
///
/// An infrastructure fault halts the search but still yields the partial
/// solution built from whatever the archive had achieved.
pub fn run<F: FitnessFunction, S: Sampler>(
    ff: &mut F,
    sampler: &S,
    harvester: &dyn ResponseHarvester,
    param: &Param,
    running: Arc<AtomicBool>,
) -> Result<Solution, Box<dyn Error>> {
    let start = std::time::Instant::now();
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    info!("miosearch {}", version());

    let mut monitor = SearchMonitor::new(param.execution.snapshot_interval);

    let mut solution = match mio(ff, sampler, harvester, param, &mut monitor, running) {
        Ok(solution) => solution,
        Err(e) => {
            error!("{}; extracting partial solution", e);
            e.partial
        }
    };
    solution.id = format!("mio_{}_{}", param.general.seed, timestamp);

    let exec_time = start.elapsed().as_secs_f64();
    info!("{} ({:.2}s)", solution.summary(), exec_time);

    let names = ff.target_names();
    if !names.is_empty() {
        let covered: Vec<String> = solution
            .overall
            .covered_targets()
            .map(|t| names.get(&t).cloned().unwrap_or_else(|| t.to_string()))
            .collect();
        info!("Covered: [{}]", covered.join(", "));
    }

    if !param.general.save_solution.is_empty() {
        solution.save_auto(&param.general.save_solution)?;
        info!("Solution saved to {}", param.general.save_solution);
    }
    if !param.execution.stats_file.is_empty() {
        monitor.export_trajectory(&param.execution.stats_file)?;
        info!("Search trajectory saved to {}", param.execution.stats_file);
    }
    if !param.execution.impact_file.is_empty() {
        crate::monitor::export_impacts(&solution, &param.execution.impact_file)?;
        info!("Impact statistics saved to {}", param.execution.impact_file);
    }

    Ok(solution)
}
