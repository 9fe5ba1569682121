// Copyright (c) Facebook, Inc. and its affiliates.
use clap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use ms_util::*;

use super::config::Operation;

const HELP_BODY: &str = "\
Memory-subsystem benchmark driver.

memsys-bench runs the benchmark workloads described in a YAML configuration
file under controlled NUMA placements, repeats each run for statistical
stability, captures hardware and OS counter telemetry per run and reduces the
per-sample measurements into per-configuration averages.

Workload, placement and experiment definitions all come from the
configuration file. Execution is strictly sequential - hardware counters are
machine-global and overlapping runs would corrupt the deltas. The sweep
completes with whatever data could be gathered; runs which could not execute
or parse are reported at the end instead of aborting the sweep.

Results are written under the configured results directory as one raw text
file and zero or more counter CSV files per run, plus averaged JSON documents
at workload, family and experiment granularity.
";

lazy_static! {
    static ref ARGS_STR: String = format!(
        "-c, --config=[FILE]      'YAML configuration file (default: {dfl_config})'
         -r, --results=[DIR]      'Override the configured results directory'
         -o, --operations=[OPS]   'Comma-separated operation override (execute,process)'
         -a, --args=[FILE]        'Load base command line arguments from FILE'
         -v...                    'Sets the level of verbosity'",
        dfl_config = Args::default().config,
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub config: String,
    pub results: Option<String>,

    #[serde(skip)]
    pub operations: Option<Vec<Operation>>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: "configs.yml".into(),
            results: None,
            operations: None,
        }
    }
}

impl JsonLoad for Args {}
impl JsonSave for Args {}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        clap::App::new("memsys-bench")
            .version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> bool {
        let dfl = Args::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("config") {
            self.config = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.config.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("results") {
            self.results = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }

        if let Some(v) = matches.value_of("operations") {
            let mut ops = vec![];
            for tok in v.split(',').filter(|x| x.len() > 0) {
                match tok.trim() {
                    "execute" => ops.push(Operation::Execute),
                    "process" => ops.push(Operation::Process),
                    tok => {
                        log::warn!("args: ignoring unknown operation {:?}", tok);
                    }
                }
            }
            self.operations = Some(ops);
        }

        updated_base
    }
}
