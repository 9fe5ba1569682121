// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Key of the placement prefix inside `exe-prefixes`. The orchestrator
/// rewrites this entry per placement configuration.
pub const NUMA_PREFIX_KEY: &str = "numa";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Paths {
    pub results_directory: String,
    #[serde(default)]
    pub redis_directory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ScriptKnobs {
    #[serde(default = "dfl_samples")]
    pub samples: u32,
    #[serde(default = "dfl_update_interval")]
    pub status_update_interval: u64,
}

fn dfl_samples() -> u32 {
    1
}

fn dfl_update_interval() -> u64 {
    10
}

impl Default for ScriptKnobs {
    fn default() -> Self {
        Self {
            samples: dfl_samples(),
            status_update_interval: dfl_update_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GeneralKnobs {
    pub paths: Paths,

    /// Command prefixes prepended to every workload invocation, in
    /// listed order. Entries whose value carries a `-csv=` style token
    /// double as monitoring sources.
    #[serde(default)]
    pub exe_prefixes: Vec<BTreeMap<String, String>>,

    #[serde(default)]
    pub script_settings: ScriptKnobs,

    /// Parameter values which override the per-workload configuration,
    /// keyed by parameter name.
    #[serde(default)]
    pub overwrite: BTreeMap<String, serde_yml::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Execute,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PlacementKnobs {
    pub name: String,
    pub cpu_nodes: Vec<u32>,
    pub mem_nodes: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExperimentKnobs {
    pub name: String,

    #[serde(default)]
    pub placements: Vec<PlacementKnobs>,

    /// "family/name" selectors. Empty selects every configured workload.
    #[serde(default)]
    pub workloads: Vec<String>,

    /// Overrides the general sample count for this experiment.
    #[serde(default)]
    pub samples: Option<u32>,

    #[serde(default = "dfl_operations")]
    pub operations: Vec<Operation>,
}

fn dfl_operations() -> Vec<Operation> {
    vec![Operation::Execute, Operation::Process]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkloadKnobs {
    pub executable: String,
    pub path: String,

    /// Ordered parameter list. Each entry is a single `name: value`
    /// pair; the family strategy decides how a pair becomes a command
    /// line token.
    #[serde(default)]
    pub parameters: Vec<BTreeMap<String, serde_yml::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub general: GeneralKnobs,
    pub experiments: Vec<ExperimentKnobs>,

    /// family -> workload name -> definition
    pub workloads: BTreeMap<String, BTreeMap<String, WorkloadKnobs>>,
}

/// YAML scalars become parameter value strings verbatim.
pub fn scalar_to_string(v: &serde_yml::Value) -> Result<String> {
    match v {
        serde_yml::Value::String(s) => Ok(s.clone()),
        serde_yml::Value::Number(n) => Ok(n.to_string()),
        serde_yml::Value::Bool(b) => Ok(b.to_string()),
        v => bail!("expected a scalar parameter value, got {:?}", v),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {:?}", path))?;
        let cfg: Self = serde_yml::from_str(&buf)
            .with_context(|| format!("parsing configuration file {:?}", path))?;
        Ok(cfg)
    }

    /// All configuration problems are reported before bailing so that a
    /// bad config can be fixed in one go. Nothing executes on error.
    pub fn validate(&self, max_node: u32, family_known: &dyn Fn(&str) -> bool) -> Result<()> {
        let mut nr_errors = 0;

        if self.general.paths.results_directory.is_empty() {
            error!("cfg: paths.results-directory is empty");
            nr_errors += 1;
        }

        for (family, workloads) in self.workloads.iter() {
            if !family_known(family) {
                error!("cfg: unknown workload family {:?}", family);
                nr_errors += 1;
            }
            for (name, knobs) in workloads.iter() {
                if knobs.executable.is_empty() {
                    error!("cfg: {}/{} has no executable", family, name);
                    nr_errors += 1;
                }
                for param in knobs.parameters.iter() {
                    if param.len() != 1 {
                        error!(
                            "cfg: {}/{} parameter entries must be single name: value pairs",
                            family, name
                        );
                        nr_errors += 1;
                    }
                    for val in param.values() {
                        if let Err(e) = scalar_to_string(val) {
                            error!("cfg: {}/{}: {}", family, name, &e);
                            nr_errors += 1;
                        }
                    }
                }
            }
        }

        for exp in self.experiments.iter() {
            if exp.samples == Some(0) {
                error!("cfg: experiment {:?} has zero samples", exp.name);
                nr_errors += 1;
            }
            for pl in exp.placements.iter() {
                for node in pl.cpu_nodes.iter().chain(pl.mem_nodes.iter()) {
                    if *node > max_node {
                        error!(
                            "cfg: experiment {:?} placement {:?} uses node {} \
                             but the highest NUMA node is {}",
                            exp.name, pl.name, node, max_node
                        );
                        nr_errors += 1;
                    }
                }
            }
            for sel in exp.workloads.iter() {
                match self.lookup_selector(sel) {
                    Some(_) => {}
                    None => {
                        error!(
                            "cfg: experiment {:?} selects unknown workload {:?}",
                            exp.name, sel
                        );
                        nr_errors += 1;
                    }
                }
            }
        }

        if nr_errors > 0 {
            bail!("{} configuration error(s)", nr_errors);
        }
        Ok(())
    }

    /// Resolve a "family/name" selector.
    pub fn lookup_selector<'a>(&'a self, sel: &'a str) -> Option<(&'a str, &'a str, &'a WorkloadKnobs)> {
        let mut split = sel.splitn(2, '/');
        let family = split.next()?;
        let name = split.next()?;
        let knobs = self.workloads.get(family)?.get(name)?;
        Some((family, name, knobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = "\
general:
  paths:
    results-directory: results
  exe-prefixes:
    - pcm: \"pcm 0.5 -csv=pcm.csv --external-program\"
    - numa: \"numactl\"
  script-settings:
    samples: 3
    status-update-interval: 2
experiments:
  - name: numa-mode-compare
    placements:
      - name: local
        cpu-nodes: [0]
        mem-nodes: [0]
      - name: remote
        cpu-nodes: [0]
        mem-nodes: [1]
    workloads: [\"pmbench/rand\"]
workloads:
  pmbench:
    rand:
      executable: pmbench
      path: /opt/pmbench
      parameters:
        - threads: 8
        - mapsize: 22000
        - time: 60
";

    #[test]
    fn test_load_and_validate() {
        let cfg: Config = serde_yml::from_str(CFG).unwrap();
        assert_eq!(cfg.general.script_settings.samples, 3);
        assert_eq!(cfg.experiments[0].placements.len(), 2);
        assert_eq!(
            cfg.experiments[0].operations,
            vec![Operation::Execute, Operation::Process]
        );

        let params = &cfg.workloads["pmbench"]["rand"].parameters;
        assert_eq!(params.len(), 3);
        assert_eq!(scalar_to_string(&params[0]["threads"]).unwrap(), "8");

        cfg.validate(1, &|tag| tag == "pmbench").unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_node_and_family() {
        let cfg: Config = serde_yml::from_str(CFG).unwrap();

        // Node 1 out of range on a single-node machine.
        assert!(cfg.validate(0, &|tag| tag == "pmbench").is_err());
        // Unknown family.
        assert!(cfg.validate(1, &|_| false).is_err());
    }

    #[test]
    fn test_selector_lookup() {
        let cfg: Config = serde_yml::from_str(CFG).unwrap();
        assert!(cfg.lookup_selector("pmbench/rand").is_some());
        assert!(cfg.lookup_selector("pmbench/seq").is_none());
        assert!(cfg.lookup_selector("pmbench").is_none());
    }
}
