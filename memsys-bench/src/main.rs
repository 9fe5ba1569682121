// Copyright (c) Facebook, Inc. and its affiliates.
use log::{error, info, warn};
use std::process::exit;

use memsys_bench_intf::{Args, Config};
use ms_util::*;

mod experiment;
mod progress;
mod run;
mod service;
mod study;
mod telemetry;
mod workload;

use run::RunCtx;

fn main() {
    setup_prog_state();
    workload::init_families();

    let args_file = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("Failed to process args file ({})", &e);
        exit(1);
    });
    let args = &args_file.data;

    let config = Config::load(&args.config).unwrap_or_else(|e| {
        error!("{:#}", &e);
        exit(1);
    });

    let max_node = max_numa_node().unwrap_or(0);
    if let Err(e) = config.validate(max_node, &workload::family_known) {
        error!("{:#}", &e);
        exit(1);
    }

    let experiments = experiment::build_experiments(&config).unwrap_or_else(|e| {
        error!("{:#}", &e);
        exit(1);
    });

    let mut rctx = RunCtx::new(&config.general, args.results.as_deref());
    let mut skips = vec![];
    let started_at = unix_now();

    for exp in experiments.iter() {
        if prog_exiting() {
            break;
        }
        if let Err(e) = exp.run(&mut rctx, args.operations.as_deref(), &mut skips) {
            error!("Experiment {} failed ({})", &exp.name, &e);
        }
    }

    info!(
        "Sweep finished ({} - {})",
        format_unix_time(started_at),
        format_unix_time(unix_now())
    );
    if skips.is_empty() {
        info!("All cells completed");
    } else {
        warn!("{} cell(s) skipped or failed:", skips.len());
        for skip in skips.iter() {
            warn!("  {}: {}", &skip.what, &skip.why);
        }
    }
}
