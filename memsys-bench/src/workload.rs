// Copyright (c) Facebook, Inc. and its affiliates.

// The individual family implementations under workload/ inherit all
// uses from this file. Make common stuff available.
use anyhow::{bail, Result};
use log::warn;
use std::sync::{Arc, Mutex};

use crate::run::{ExecutionError, RunCtx, RunId, RunRecord};
use crate::telemetry::MeasurementTree;
use memsys_bench_intf::{scalar_to_string, GeneralKnobs, WorkloadKnobs};

lazy_static::lazy_static! {
    static ref FAMILIES: Mutex<Vec<Arc<Box<dyn Family>>>> = Mutex::new(vec![]);
}

pub fn find_family(tag: &str) -> Result<Arc<Box<dyn Family>>> {
    for family in FAMILIES.lock().unwrap().iter() {
        if family.tag() == tag {
            return Ok(family.clone());
        }
    }
    bail!("unknown workload family {:?}", tag);
}

pub fn family_known(tag: &str) -> bool {
    find_family(tag).is_ok()
}

fn register_family(family: Box<dyn Family>) -> () {
    FAMILIES.lock().unwrap().push(Arc::new(family));
}

mod cachebench;
mod gapbs;
mod memtier;
mod pmbench;
mod tailbench;
mod ycsb;

pub fn init_families() -> () {
    register_family(Box::new(tailbench::Tailbench {}));
    register_family(Box::new(ycsb::Ycsb {}));
    register_family(Box::new(memtier::Memtier {}));
    register_family(Box::new(pmbench::Pmbench {}));
    register_family(Box::new(cachebench::Cachebench {}));
    register_family(Box::new(gapbs::Gapbs {}));
}

/// Everything a workload family does differently: how a configured
/// parameter becomes a command line token, what has to run around the
/// workload process, and how its output text parses.
pub trait Family: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Pure - the same (name, value) always yields the same token.
    fn format_parameter(&self, name: &str, value: &str) -> String {
        format!("--{}={}", name, value)
    }

    /// Bracket the raw execution. The default is a plain engine run;
    /// families which depend on a backing service override this.
    fn wrap_execution(
        &self,
        rctx: &mut RunCtx,
        workload: &Workload,
        run: &RunId,
    ) -> Result<RunRecord, ExecutionError> {
        rctx.run_workload(workload, run)
    }

    /// Family-specific text grammar over the raw output, producing the
    /// "specific" measurement subtree.
    fn parse_specific(&self, _raw: &str) -> MeasurementTree {
        warn!("{}: this family has no specific results", self.tag());
        MeasurementTree::new()
    }
}

/// Lifecycle of one (workload, placement, sample) cell. Terminal states
/// are final; the sweep never retries a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Workload {
    pub name: String,
    pub family: String,
    pub executable: String,
    pub path: String,

    /// Family-formatted tokens in configured order.
    pub parameters: Vec<String>,
}

impl Workload {
    pub fn from_knobs(
        family: &str,
        name: &str,
        knobs: &WorkloadKnobs,
        general: &GeneralKnobs,
    ) -> Result<Self> {
        let strategy = find_family(family)?;

        let mut parameters = vec![];
        for entry in knobs.parameters.iter() {
            for (pname, pval) in entry.iter() {
                let val = match general.overwrite.get(pname) {
                    Some(ovr) => scalar_to_string(ovr)?,
                    None => scalar_to_string(pval)?,
                };
                parameters.push(strategy.format_parameter(pname, &val));
            }
        }

        Ok(Self {
            name: name.to_string(),
            family: family.to_string(),
            executable: knobs.executable.clone(),
            path: knobs.path.clone(),
            parameters,
        })
    }

    /// Prefixes, executable, parameters - always in that order.
    pub fn build_command(&self, prefixes: &[String]) -> String {
        let mut tokens: Vec<String> = prefixes
            .iter()
            .filter(|prefix| !prefix.is_empty())
            .cloned()
            .collect();
        tokens.push(format!("./{}", &self.executable));
        tokens.extend(self.parameters.iter().cloned());
        tokens.join(" ")
    }
}
