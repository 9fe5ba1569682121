// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::run::{ExecutionError, RunCtx, RunId};
use crate::study;
use crate::telemetry::{self, MeasurementTree};
use crate::workload::{self, RunStatus, Workload};
use memsys_bench_intf::{
    Config, ExperimentKnobs, Operation, PlacementKnobs, NUMA_PREFIX_KEY,
};
use ms_util::*;

#[derive(Debug, Clone)]
pub struct Placement {
    pub name: String,
    pub cpu_nodes: Vec<u32>,
    pub mem_nodes: Vec<u32>,
}

impl Placement {
    fn from_knobs(knobs: &PlacementKnobs) -> Self {
        Self {
            name: knobs.name.clone(),
            cpu_nodes: knobs.cpu_nodes.clone(),
            mem_nodes: knobs.mem_nodes.clone(),
        }
    }

    /// numactl invocation pinning execution and allocation nodes.
    pub fn numactl_prefix(&self, base: &str) -> String {
        format!(
            "{} --cpunodebind={} --membind={}",
            base,
            join_nodes(&self.cpu_nodes),
            join_nodes(&self.mem_nodes)
        )
    }
}

fn join_nodes(nodes: &[u32]) -> String {
    nodes
        .iter()
        .map(|node| node.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// A cell the sweep could not complete, reported at the end.
#[derive(Debug)]
pub struct SkippedCell {
    pub what: String,
    pub why: String,
}

/// family -> workload -> placement -> averaged measurement root.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ResultDoc(pub BTreeMap<String, BTreeMap<String, BTreeMap<String, MeasurementTree>>>);

impl JsonSave for ResultDoc {}

pub struct Experiment {
    pub name: String,
    pub workloads: Vec<Workload>,
    pub placements: Vec<Placement>,
    pub samples: u32,
    pub operations: Vec<Operation>,
}

pub fn build_experiments(cfg: &Config) -> Result<Vec<Experiment>> {
    cfg.experiments
        .iter()
        .map(|knobs| Experiment::new(cfg, knobs))
        .collect()
}

impl Experiment {
    fn new(cfg: &Config, knobs: &ExperimentKnobs) -> Result<Self> {
        let mut workloads = vec![];
        if knobs.workloads.is_empty() {
            for (family, defs) in cfg.workloads.iter() {
                for (name, wk) in defs.iter() {
                    workloads.push(Workload::from_knobs(family, name, wk, &cfg.general)?);
                }
            }
        } else {
            for sel in knobs.workloads.iter() {
                match cfg.lookup_selector(sel) {
                    Some((family, name, wk)) => {
                        workloads.push(Workload::from_knobs(family, name, wk, &cfg.general)?)
                    }
                    None => bail!(
                        "experiment {:?} selects unknown workload {:?}",
                        &knobs.name,
                        sel
                    ),
                }
            }
        }

        Ok(Self {
            name: knobs.name.clone(),
            workloads,
            placements: knobs.placements.iter().map(Placement::from_knobs).collect(),
            samples: knobs.samples.unwrap_or(cfg.general.script_settings.samples).max(1),
            operations: knobs.operations.clone(),
        })
    }

    pub fn run(
        &self,
        rctx: &mut RunCtx,
        ops_override: Option<&[Operation]>,
        skips: &mut Vec<SkippedCell>,
    ) -> Result<()> {
        let ops = ops_override.unwrap_or(&self.operations);

        info!("exp: === {} ===", &self.name);
        for op in ops.iter() {
            match op {
                Operation::Execute => self.execute_phase(rctx, skips)?,
                Operation::Process => self.process_phase(rctx, skips)?,
            }
        }
        Ok(())
    }

    /// Placement cells; a placement-less experiment still has exactly
    /// one.
    fn placement_cells(&self) -> Vec<Option<&Placement>> {
        if self.placements.is_empty() {
            vec![None]
        } else {
            self.placements.iter().map(Some).collect()
        }
    }

    fn placement_key(placement: Option<&Placement>) -> String {
        match placement {
            Some(placement) => placement.name.clone(),
            None => "default".to_string(),
        }
    }

    fn run_id(&self, wl: &Workload, placement: Option<&Placement>, sample: u32) -> RunId {
        RunId {
            experiment: self.name.clone(),
            family: wl.family.clone(),
            workload: wl.name.clone(),
            // The placement segment only disambiguates multi-placement
            // sweeps.
            placement: match self.placements.len() > 1 {
                true => placement.map(|p| p.name.clone()),
                false => None,
            },
            sample,
        }
    }

    fn create_result_dirs(&self, results_dir: &Path) -> Result<()> {
        let exp_dir = results_dir.join(&self.name);
        if exp_dir.exists() {
            fs::remove_dir_all(&exp_dir)?;
        }
        for wl in self.workloads.iter() {
            fs::create_dir_all(exp_dir.join(&wl.family).join(&wl.name).join("raw"))?;
        }
        Ok(())
    }

    fn execute_phase(&self, rctx: &mut RunCtx, skips: &mut Vec<SkippedCell>) -> Result<()> {
        self.create_result_dirs(&rctx.results_dir)?;

        rctx.save_prefixes();
        let ret = self.execute_sweep(rctx, skips);
        rctx.restore_prefixes();
        ret
    }

    fn cell_name(&self, wl: &Workload, placement: Option<&Placement>, sample: u32) -> String {
        format!(
            "{}/{}:{}:{}",
            &wl.family,
            &wl.name,
            Self::placement_key(placement),
            sample
        )
    }

    fn execute_sweep(&self, rctx: &mut RunCtx, skips: &mut Vec<SkippedCell>) -> Result<()> {
        let numa_base = rctx.prefixes.get(NUMA_PREFIX_KEY).map(str::to_string);

        // The full workload x placement x sample cross-product up
        // front; every cell ends in a terminal state or stays Queued
        // when its workload was skipped.
        let mut statuses: BTreeMap<String, RunStatus> = BTreeMap::new();
        for wl in self.workloads.iter() {
            for placement in self.placement_cells() {
                for sample in 0..self.samples {
                    statuses.insert(self.cell_name(wl, placement, sample), RunStatus::Queued);
                }
            }
        }

        for wl in self.workloads.iter() {
            if !Path::new(&wl.path).exists() {
                let e = ExecutionError::MissingExecutable(wl.path.clone());
                error!("exp: [{} - {}] {}, skipping workload", &wl.family, &wl.name, &e);
                skips.push(SkippedCell {
                    what: format!("{}/{}", &wl.family, &wl.name),
                    why: e.to_string(),
                });
                continue;
            }
            let strategy = workload::find_family(&wl.family)?;

            'placements: for placement in self.placement_cells() {
                if let (Some(placement), Some(base)) = (placement, numa_base.as_ref()) {
                    rctx.prefixes
                        .set(NUMA_PREFIX_KEY, placement.numactl_prefix(base));
                }

                for sample in 0..self.samples {
                    if prog_exiting() {
                        bail!("interrupted");
                    }

                    let run = self.run_id(wl, placement, sample);
                    let cell = self.cell_name(wl, placement, sample);
                    rctx.prefixes.point_csvs_at(&rctx.results_dir, &run);

                    statuses.insert(cell.clone(), RunStatus::Running);
                    match strategy.wrap_execution(rctx, wl, &run) {
                        Ok(record) => {
                            if !record.exit_ok {
                                warn!(
                                    "exp: {} exited non-zero after {}",
                                    run.stem(),
                                    format_duration(record.duration_secs)
                                );
                            }
                            if let Some(migrated) = record.vmstat_delta.get("pgmigrate_success") {
                                debug!("exp: {}: {} page(s) migrated", run.stem(), migrated);
                            }
                            statuses.insert(cell, RunStatus::Completed);
                        }
                        Err(e @ ExecutionError::MissingExecutable(_)) => {
                            error!("exp: {} ({}), skipping workload", run.stem(), &e);
                            statuses.insert(cell.clone(), RunStatus::Failed(e.to_string()));
                            skips.push(SkippedCell {
                                what: cell,
                                why: e.to_string(),
                            });
                            break 'placements;
                        }
                        Err(e @ ExecutionError::AuxService(_)) => {
                            // Only this (workload, placement) cell dies.
                            error!("exp: {} ({}), skipping placement", run.stem(), &e);
                            statuses.insert(cell.clone(), RunStatus::Failed(e.to_string()));
                            skips.push(SkippedCell {
                                what: cell,
                                why: e.to_string(),
                            });
                            continue 'placements;
                        }
                        Err(e) => {
                            error!("exp: {} ({})", run.stem(), &e);
                            statuses.insert(cell.clone(), RunStatus::Failed(e.to_string()));
                            skips.push(SkippedCell {
                                what: cell,
                                why: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        let nr_completed = statuses
            .values()
            .filter(|status| **status == RunStatus::Completed)
            .count();
        info!(
            "exp: {} execution done, {}/{} cell(s) completed",
            &self.name,
            nr_completed,
            statuses.len()
        );
        Ok(())
    }

    fn process_phase(&self, rctx: &mut RunCtx, skips: &mut Vec<SkippedCell>) -> Result<()> {
        let results_dir = rctx.results_dir.clone();
        let exp_dir = results_dir.join(&self.name);
        let sources = rctx.prefixes.csv_sources();

        let mut by_family: BTreeMap<&str, Vec<&Workload>> = BTreeMap::new();
        for wl in self.workloads.iter() {
            by_family.entry(wl.family.as_str()).or_default().push(wl);
        }

        let mut doc = ResultDoc::default();

        for (family_tag, wls) in by_family.iter() {
            let fam_dir = exp_dir.join(family_tag);

            for wl in wls.iter() {
                let strategy = workload::find_family(&wl.family)?;
                let wl_dir = fam_dir.join(&wl.name);

                for placement in self.placement_cells() {
                    let pl_key = Self::placement_key(placement);
                    info!(
                        "exp: [{} - {}] processing results ({})",
                        &wl.family, &wl.name, &pl_key
                    );

                    let mut sample_trees = vec![];
                    for sample in 0..self.samples {
                        let run = self.run_id(wl, placement, sample);
                        let raw_path = run.raw_path(&results_dir);
                        let raw = match fs::read_to_string(&raw_path) {
                            Ok(v) => v,
                            Err(e) => {
                                error!("exp: failed to read {:?} ({})", &raw_path, &e);
                                skips.push(SkippedCell {
                                    what: run.stem(),
                                    why: format!("missing raw output ({})", &e),
                                });
                                continue;
                            }
                        };

                        let mut general = telemetry::parse_delta_lines(&raw);
                        for source in sources.iter() {
                            let csv_path = run.counter_csv_path(&results_dir, source);
                            match telemetry::parse_counter_csv(&csv_path) {
                                Ok(tree) => general.merge(tree),
                                Err(e) => error!(
                                    "exp: failed to parse counter file {:?} ({})",
                                    &csv_path, &e
                                ),
                            }
                        }

                        let mut root = BTreeMap::new();
                        root.insert("general".to_string(), general);
                        root.insert("specific".to_string(), strategy.parse_specific(&raw));
                        sample_trees.push(MeasurementTree::Branch(root));
                    }

                    let averaged = study::average(sample_trees.iter());
                    doc.0
                        .entry(wl.family.clone())
                        .or_default()
                        .entry(wl.name.clone())
                        .or_default()
                        .insert(pl_key, averaged);
                }

                persist(&doc, &wl_dir.join(format!("{}.json", &wl.name)))?;
            }

            persist(&doc, &fam_dir.join(format!("{}.json", family_tag)))?;
        }

        persist(&doc, &exp_dir.join(format!("{}.json", &self.name)))?;
        Ok(())
    }
}

fn persist(doc: &ResultDoc, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut report = JsonReportFile::<ResultDoc>::new(Some(path));
    report.data = doc.clone();
    report.commit()?;
    info!("exp: wrote {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsys_bench_intf::{GeneralKnobs, Paths, ScriptKnobs};
    use std::os::unix::fs::PermissionsExt;

    fn general_knobs(results_dir: &Path) -> GeneralKnobs {
        GeneralKnobs {
            paths: Paths {
                results_directory: results_dir.to_string_lossy().into_owned(),
                redis_directory: None,
            },
            exe_prefixes: vec![],
            script_settings: ScriptKnobs {
                samples: 3,
                status_update_interval: 1,
            },
            overwrite: Default::default(),
        }
    }

    fn placement(name: &str, cpu: u32, mem: u32) -> Placement {
        Placement {
            name: name.into(),
            cpu_nodes: vec![cpu],
            mem_nodes: vec![mem],
        }
    }

    #[test]
    fn test_numactl_prefix() {
        let pl = Placement {
            name: "interleave".into(),
            cpu_nodes: vec![0],
            mem_nodes: vec![0, 1],
        };
        assert_eq!(
            pl.numactl_prefix("numactl"),
            "numactl --cpunodebind=0 --membind=0,1"
        );
    }

    #[test]
    fn test_placement_sweep_produces_deterministic_files() {
        workload::init_families();

        let results = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let script = workdir.path().join("bfs.sh");
        fs::write(&script, "#!/bin/sh\necho Trial Time: 0.5\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let exp = Experiment {
            name: "placement-sweep".into(),
            workloads: vec![Workload {
                name: "bfs".into(),
                family: "gapbs".into(),
                executable: "bfs.sh".into(),
                path: workdir.path().to_string_lossy().into_owned(),
                parameters: vec![],
            }],
            placements: vec![placement("local", 0, 0), placement("remote", 0, 1)],
            samples: 3,
            operations: vec![Operation::Execute],
        };

        let mut rctx = RunCtx::new(&general_knobs(results.path()), None);
        let mut skips = vec![];
        exp.execute_phase(&mut rctx, &mut skips).unwrap();
        assert!(skips.is_empty());

        let raw_dir = results
            .path()
            .join("placement-sweep/gapbs/bfs/raw");
        let mut names: Vec<String> = fs::read_dir(&raw_dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|ent| ent.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "local-bfs-0",
                "local-bfs-1",
                "local-bfs-2",
                "remote-bfs-0",
                "remote-bfs-1",
                "remote-bfs-2",
            ]
        );
    }

    #[test]
    fn test_missing_workload_path_skips_without_aborting() {
        workload::init_families();

        let results = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let script = workdir.path().join("ok.sh");
        fs::write(&script, "#!/bin/sh\necho fine\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let missing = Workload {
            name: "gone".into(),
            family: "cachebench".into(),
            executable: "gone".into(),
            path: "/definitely/not/here".into(),
            parameters: vec![],
        };
        let present = Workload {
            name: "ok".into(),
            family: "cachebench".into(),
            executable: "ok.sh".into(),
            path: workdir.path().to_string_lossy().into_owned(),
            parameters: vec![],
        };

        let exp = Experiment {
            name: "skip-check".into(),
            workloads: vec![missing, present],
            placements: vec![],
            samples: 1,
            operations: vec![Operation::Execute],
        };

        let mut rctx = RunCtx::new(&general_knobs(results.path()), None);
        let mut skips = vec![];
        exp.execute_phase(&mut rctx, &mut skips).unwrap();

        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].what, "cachebench/gone");
        // The healthy workload still ran.
        assert!(results
            .path()
            .join("skip-check/cachebench/ok/raw/ok-0")
            .exists());
    }

    #[test]
    fn test_process_phase_averages_and_persists() {
        workload::init_families();

        let results = tempfile::tempdir().unwrap();

        let exp = Experiment {
            name: "reduce-check".into(),
            workloads: vec![Workload {
                name: "bfs".into(),
                family: "gapbs".into(),
                executable: "bfs".into(),
                path: "/opt/gapbs".into(),
                parameters: vec![],
            }],
            placements: vec![],
            samples: 2,
            operations: vec![Operation::Process],
        };

        let raw_dir = results.path().join("reduce-check/gapbs/bfs/raw");
        fs::create_dir_all(&raw_dir).unwrap();
        fs::write(
            raw_dir.join("bfs-0"),
            "Trial Time: 2.0\nTrial Time: 4.0\n\nnuma_hit = 100\n",
        )
        .unwrap();
        fs::write(
            raw_dir.join("bfs-1"),
            "Trial Time: 5.0\n\nnuma_hit = 200\n",
        )
        .unwrap();
        // Only sample 0 has a counter csv; Freq averages over one
        // sample, not two.
        fs::write(raw_dir.join("bfs-0-pcm.csv"), "System\nFreq\n3.2\n").unwrap();

        let mut general = general_knobs(results.path());
        general.exe_prefixes = vec![{
            let mut entry = BTreeMap::new();
            entry.insert(
                "pcm".to_string(),
                "pcm 0.5 -csv=pcm.csv --external-program".to_string(),
            );
            entry
        }];

        let mut rctx = RunCtx::new(&general, None);
        let mut skips = vec![];
        exp.process_phase(&mut rctx, &mut skips).unwrap();
        assert!(skips.is_empty());

        let doc: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(results.path().join("reduce-check/reduce-check.json")).unwrap(),
        )
        .unwrap();
        let root = &doc["gapbs"]["bfs"]["default"];
        assert_eq!(root["general"]["System"]["numa_hit"], 150.0);
        assert_eq!(root["general"]["System"]["Freq"], 3.2);
        assert_eq!(root["specific"]["Time"]["Trial Average"], 4.0);
        assert_eq!(root["specific"]["Time"]["Trials"], 1.5);

        // The per-workload document carries the same mapping.
        let wl_doc: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(results.path().join("reduce-check/gapbs/bfs/bfs.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(wl_doc["gapbs"]["bfs"]["default"]["general"]["System"]["numa_hit"], 150.0);
    }
}
