use flexi_logger::{FileSpec, Logger};
use log::info;
use miosearch::benchmark::OneMaxProblem;
use miosearch::eval::NoHarvest;
use miosearch::param;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() {
    let param_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "param.yaml".to_string());

    let param = match param::get(param_file.clone()) {
        Ok(param) => param,
        Err(e) => {
            eprintln!("Cannot load parameters from {}: {}", param_file, e);
            std::process::exit(1);
        }
    };

    let _logger = if param.general.log_base.is_empty() {
        Logger::try_with_str(&param.general.log_level)
            .expect("invalid log level")
            .start()
            .expect("cannot start logger")
    } else {
        Logger::try_with_str(&param.general.log_level)
            .expect("invalid log level")
            .log_to_file(
                FileSpec::default()
                    .basename(param.general.log_base.clone())
                    .suffix(param.general.log_suffix.clone()),
            )
            .start()
            .expect("cannot start logger")
    };

    let running = Arc::new(AtomicBool::new(true));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let flag = Arc::clone(&running);
        unsafe {
            signal_hook::low_level::register(signal, move || {
                flag.store(false, Ordering::Relaxed);
            })
        }
        .expect("cannot register signal handler");
    }

    info!(
        "Benchmark run: {} targets over {} actions",
        param.benchmark.targets, param.benchmark.actions
    );

    let mut fitness = OneMaxProblem::new(param.benchmark.targets, param.benchmark.actions);
    let sampler = OneMaxProblem::new(param.benchmark.targets, param.benchmark.actions);

    match miosearch::run(&mut fitness, &sampler, &NoHarvest, &param, running) {
        Ok(solution) => println!("{}", solution.summary()),
        Err(e) => {
            eprintln!("Run failed: {}", e);
            std::process::exit(1);
        }
    }
}
