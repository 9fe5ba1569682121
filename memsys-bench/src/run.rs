// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use chrono::Local;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::progress::HeartbeatProgress;
use crate::telemetry::VMSTAT_KEYS;
use crate::workload::Workload;
use memsys_bench_intf::GeneralKnobs;
use ms_util::*;

pub const VMSTAT_PATH: &str = "/proc/vmstat";

/// Why a run could not produce a result. The orchestrator's failure
/// policy keys off the variant; none of these aborts the sweep.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("workload directory {0:?} does not exist")]
    MissingExecutable(String),
    #[error("auxiliary service failed ({0})")]
    AuxService(String),
    #[error("failed to run workload ({0})")]
    Process(String),
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub exit_ok: bool,
    pub duration_secs: f64,
    pub vmstat_delta: BTreeMap<String, i64>,
}

/// Identity of one (workload, placement, sample) cell plus everything
/// needed to derive its output paths. Passed by value through the call
/// chain - never stored on the workload descriptor.
#[derive(Debug, Clone)]
pub struct RunId {
    pub experiment: String,
    pub family: String,
    pub workload: String,
    pub placement: Option<String>,
    pub sample: u32,
}

impl RunId {
    pub fn stem(&self) -> String {
        match self.placement.as_ref() {
            Some(placement) => format!("{}-{}-{}", placement, self.workload, self.sample),
            None => format!("{}-{}", self.workload, self.sample),
        }
    }

    pub fn raw_dir(&self, results_dir: &Path) -> PathBuf {
        results_dir
            .join(&self.experiment)
            .join(&self.family)
            .join(&self.workload)
            .join("raw")
    }

    pub fn raw_path(&self, results_dir: &Path) -> PathBuf {
        self.raw_dir(results_dir).join(self.stem())
    }

    pub fn counter_csv_path(&self, results_dir: &Path, source: &str) -> PathBuf {
        self.raw_dir(results_dir)
            .join(format!("{}-{}.csv", self.stem(), source))
    }
}

/// Ordered execution prefix state. The orchestrator overrides the
/// placement entry and the csv paths per run and restores the whole
/// map around each execution phase.
#[derive(Debug, Clone, Default)]
pub struct ExecPrefixes(Vec<(String, String)>);

impl ExecPrefixes {
    pub fn from_config(entries: &[BTreeMap<String, String>]) -> Self {
        let mut prefixes = vec![];
        for entry in entries.iter() {
            for (key, val) in entry.iter() {
                prefixes.push((key.clone(), val.clone()));
            }
        }
        Self(prefixes)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, val: String) {
        match self.0.iter().position(|(k, _)| k == key) {
            Some(idx) => self.0[idx].1 = val,
            None => self.0.push((key.to_string(), val)),
        }
    }

    /// Prefix strings in configured order, ready for command assembly.
    pub fn tokens(&self) -> Vec<String> {
        self.0.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Monitoring sources: the prefixes which write a counter csv.
    pub fn csv_sources(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, v)| v.split_whitespace().any(|tok| tok.contains("csv")))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Repoint every source's csv output at this run's counter file.
    pub fn point_csvs_at(&mut self, results_dir: &Path, run: &RunId) {
        for (key, val) in self.0.iter_mut() {
            let mut tokens: Vec<String> = val.split_whitespace().map(str::to_string).collect();
            let mut changed = false;
            for tok in tokens.iter_mut() {
                if tok.contains("csv") {
                    *tok = format!("-csv={}", run.counter_csv_path(results_dir, key).display());
                    changed = true;
                }
            }
            if changed {
                *val = tokens.join(" ");
            }
        }
    }
}

/// Per-sweep execution context owned by the orchestrator. Taking the
/// engine by &mut keeps runs strictly serial - counter snapshots are
/// machine-global state.
pub struct RunCtx {
    pub results_dir: PathBuf,
    pub prefixes: ExecPrefixes,
    pub heartbeat: Duration,
    pub redis_dir: Option<String>,

    saved_prefixes: Option<ExecPrefixes>,
}

impl RunCtx {
    pub fn new(general: &GeneralKnobs, results_override: Option<&str>) -> Self {
        let results_dir = results_override.unwrap_or(&general.paths.results_directory);
        Self {
            results_dir: PathBuf::from(results_dir),
            prefixes: ExecPrefixes::from_config(&general.exe_prefixes),
            heartbeat: Duration::from_secs(general.script_settings.status_update_interval.max(1)),
            redis_dir: general.paths.redis_directory.clone(),
            saved_prefixes: None,
        }
    }

    /// Prefix overrides are scoped to one execution phase.
    pub fn save_prefixes(&mut self) {
        self.saved_prefixes = Some(self.prefixes.clone());
    }

    pub fn restore_prefixes(&mut self) {
        if let Some(saved) = self.saved_prefixes.take() {
            self.prefixes = saved;
        }
    }

    /// Run one workload process to completion: redirect its stdout to
    /// the raw output file, poll liveness at the heartbeat interval and
    /// bracket it with NUMA counter snapshots whose delta is appended
    /// to the same file as "key = value" lines.
    pub fn run_workload(
        &mut self,
        workload: &Workload,
        run: &RunId,
    ) -> Result<RunRecord, ExecutionError> {
        if !Path::new(&workload.path).exists() {
            return Err(ExecutionError::MissingExecutable(workload.path.clone()));
        }

        let cmd = workload.build_command(&self.prefixes.tokens());
        let out_path = run.raw_path(&self.results_dir);

        info!("run: [{} - {}] {}", &workload.family, &workload.name, &cmd);

        let out_file = fs::File::create(&out_path)
            .map_err(|e| ExecutionError::Process(format!("creating {:?} ({})", &out_path, &e)))?;

        let before = vmstat_snapshot();
        let started = Instant::now();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .current_dir(&workload.path)
            .stdout(Stdio::from(out_file))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExecutionError::Process(format!("spawn failed ({})", &e)))?;

        let mut progress = HeartbeatProgress::new();
        let mut nr_updates = 0;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecutionError::Process(format!("wait failed ({})", &e)));
                }
            }
            match wait_prog_state(self.heartbeat) {
                ProgState::Exiting => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecutionError::Process("interrupted".into()));
                }
                _ => {
                    nr_updates += 1;
                    progress.set_status(&format!(
                        "[Update {}] {} - {}: {}",
                        nr_updates,
                        &workload.family,
                        &workload.name,
                        Local::now().format("%d/%m/%Y %H:%M:%S")
                    ));
                }
            }
        };

        let duration_secs = started.elapsed().as_secs_f64();
        let after = vmstat_snapshot();
        drop(progress);

        let delta = vmstat_delta(&before, &after);
        if let Err(e) = append_delta(&out_path, &delta) {
            warn!("run: failed to append counter deltas to {:?} ({})", &out_path, &e);
        }

        info!(
            "run: [{} - {}] finished in {}",
            &workload.family,
            &workload.name,
            format_duration(duration_secs)
        );

        Ok(RunRecord {
            exit_ok: status.success(),
            duration_secs,
            vmstat_delta: delta,
        })
    }
}

fn vmstat_snapshot() -> BTreeMap<String, u64> {
    match read_flat_keyed_file(VMSTAT_PATH) {
        Ok(map) => map
            .into_iter()
            .filter(|(key, _)| VMSTAT_KEYS.contains(&key.as_str()))
            .collect(),
        Err(e) => {
            warn!("run: failed to read {} ({})", VMSTAT_PATH, &e);
            Default::default()
        }
    }
}

fn vmstat_delta(
    before: &BTreeMap<String, u64>,
    after: &BTreeMap<String, u64>,
) -> BTreeMap<String, i64> {
    let mut delta = BTreeMap::new();
    for (key, end) in after.iter() {
        if let Some(start) = before.get(key) {
            delta.insert(key.clone(), *end as i64 - *start as i64);
        }
    }
    delta
}

fn append_delta(path: &Path, delta: &BTreeMap<String, i64>) -> Result<()> {
    if delta.is_empty() {
        return Ok(());
    }
    let mut f = fs::OpenOptions::new().append(true).open(path)?;
    let mut buf = String::from("\n");
    for (key, val) in delta.iter() {
        buf += &format!("{} = {}\n", key, val);
    }
    f.write_all(buf.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn run_id(placement: Option<&str>, sample: u32) -> RunId {
        RunId {
            experiment: "numa-mode-compare".into(),
            family: "gapbs".into(),
            workload: "bfs".into(),
            placement: placement.map(str::to_string),
            sample,
        }
    }

    #[test]
    fn test_run_id_paths() {
        let run = run_id(Some("local"), 2);
        assert_eq!(run.stem(), "local-bfs-2");
        assert_eq!(
            run.raw_path(Path::new("results")),
            Path::new("results/numa-mode-compare/gapbs/bfs/raw/local-bfs-2")
        );
        assert_eq!(
            run.counter_csv_path(Path::new("results"), "pcm"),
            Path::new("results/numa-mode-compare/gapbs/bfs/raw/local-bfs-2-pcm.csv")
        );

        // Single-placement experiments drop the placement segment.
        assert_eq!(run_id(None, 0).stem(), "bfs-0");
    }

    #[test]
    fn test_exec_prefixes() {
        let mut entries = vec![];
        let mut e0 = BTreeMap::new();
        e0.insert("pcm".to_string(), "pcm 0.5 -csv=pcm.csv --external-program".to_string());
        entries.push(e0);
        let mut e1 = BTreeMap::new();
        e1.insert("numa".to_string(), "numactl".to_string());
        entries.push(e1);

        let mut prefixes = ExecPrefixes::from_config(&entries);
        assert_eq!(prefixes.csv_sources(), vec!["pcm".to_string()]);
        assert_eq!(prefixes.get("numa"), Some("numactl"));

        prefixes.set("numa", "numactl --cpunodebind=0 --membind=1".into());
        prefixes.point_csvs_at(Path::new("results"), &run_id(Some("remote"), 0));
        assert_eq!(
            prefixes.tokens(),
            vec![
                "pcm 0.5 -csv=results/numa-mode-compare/gapbs/bfs/raw/remote-bfs-0-pcm.csv \
                 --external-program"
                    .to_string(),
                "numactl --cpunodebind=0 --membind=1".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_workload_dir() {
        let mut rctx = test_rctx(Path::new("/tmp"));
        let wl = Workload {
            name: "bfs".into(),
            family: "gapbs".into(),
            executable: "bfs".into(),
            path: "/definitely/not/here".into(),
            parameters: vec![],
        };
        match rctx.run_workload(&wl, &run_id(None, 0)) {
            Err(ExecutionError::MissingExecutable(path)) => {
                assert_eq!(path, "/definitely/not/here")
            }
            other => panic!("expected MissingExecutable, got {:?}", other.map(|_| ())),
        }
    }

    fn test_rctx(results_dir: &Path) -> RunCtx {
        RunCtx {
            results_dir: results_dir.to_path_buf(),
            prefixes: Default::default(),
            heartbeat: Duration::from_secs(1),
            redis_dir: None,
            saved_prefixes: None,
        }
    }

    #[test]
    fn test_run_workload_captures_output_and_deltas() {
        let results = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();

        let script = workdir.path().join("emit.sh");
        fs::write(&script, "#!/bin/sh\necho benchmark says hello\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let run = run_id(None, 0);
        fs::create_dir_all(run.raw_dir(results.path())).unwrap();

        let wl = Workload {
            name: "bfs".into(),
            family: "gapbs".into(),
            executable: "emit.sh".into(),
            path: workdir.path().to_string_lossy().into_owned(),
            parameters: vec![],
        };

        let mut rctx = test_rctx(results.path());
        let rec = rctx.run_workload(&wl, &run).unwrap();
        assert!(rec.exit_ok);

        let raw = fs::read_to_string(run.raw_path(results.path())).unwrap();
        assert!(raw.starts_with("benchmark says hello\n"));

        // Whatever deltas the host produced are engine counter keys
        // and were appended as "key = value" lines.
        for key in rec.vmstat_delta.keys() {
            assert!(VMSTAT_KEYS.contains(&key.as_str()));
            assert!(raw.contains(&format!("{} = ", key)));
        }
    }

    #[test]
    fn test_prefix_save_restore() {
        let mut rctx = test_rctx(Path::new("/tmp"));
        rctx.prefixes.set("numa", "numactl".into());

        rctx.save_prefixes();
        rctx.prefixes.set("numa", "numactl --membind=1".into());
        rctx.restore_prefixes();

        assert_eq!(rctx.prefixes.get("numa"), Some("numactl"));
    }
}
