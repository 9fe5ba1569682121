// Copyright (c) Facebook, Inc. and its affiliates.
use log::{info, warn};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use crate::run::{ExecutionError, RunCtx};
use memsys_bench_intf::NUMA_PREFIX_KEY;
use ms_util::run_command;

/// Give the server time to come up before the client hammers it, and
/// time to die before the next cell starts another one.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
}

/// Backing-service lifecycle contract. Returns the number of errors
/// encountered; zero means the action fully succeeded.
pub fn manage(redis_dir: &str, numa_prefix: &str, action: Action) -> u32 {
    match action {
        Action::Start => start(redis_dir, numa_prefix),
        Action::Stop => stop(redis_dir),
    }
}

fn start(redis_dir: &str, numa_prefix: &str) -> u32 {
    let mut nr_errors = 0;

    // Stale dump files slow server startup and eat scratch space.
    remove_dump_files(Path::new(redis_dir));
    if let Ok(cwd) = std::env::current_dir() {
        remove_dump_files(&cwd);
    }

    // The server runs under the same placement prefix as the workload.
    let server = Path::new(redis_dir).join("redis-server");
    let cmd = format!("{} {}", numa_prefix, server.display());
    let cmd = cmd.trim();

    info!("svc: starting redis: {}", cmd);
    match Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(_) => sleep(SETTLE_DELAY),
        Err(e) => {
            warn!("svc: failed to start redis-server ({})", &e);
            nr_errors += 1;
        }
    }
    nr_errors
}

fn stop(redis_dir: &str) -> u32 {
    let mut nr_errors = 0;

    let cli = Path::new(redis_dir).join("redis-cli");
    if let Err(e) = run_command(
        Command::new(&cli)
            .arg("FLUSHALL")
            .stdout(Stdio::null())
            .stderr(Stdio::null()),
        "could not flush the redis server",
    ) {
        warn!("svc: {}", &e);
        nr_errors += 1;
    }

    if let Err(e) = run_command(
        Command::new("pkill").arg("-KILL").arg("-x").arg("redis-server"),
        "could not kill the redis server",
    ) {
        warn!("svc: {}", &e);
        nr_errors += 1;
    }
    sleep(SETTLE_DELAY);

    nr_errors
}

fn remove_dump_files(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(v) => v,
        Err(_) => return,
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "rdb") {
            let _ = fs::remove_file(&path);
        }
    }
}

/// Scoped acquisition of the backing service: starting errors abort the
/// cell before the workload runs, and the Drop impl guarantees the stop
/// half runs however the bracketed execution ends. Stop errors are
/// logged but never block subsequent cells.
pub struct ServiceGuard {
    redis_dir: String,
    active: bool,
}

impl ServiceGuard {
    pub fn start(rctx: &RunCtx) -> Result<Self, ExecutionError> {
        let redis_dir = match rctx.redis_dir.as_ref() {
            Some(v) => v.clone(),
            None => {
                return Err(ExecutionError::AuxService(
                    "no redis-directory configured".into(),
                ))
            }
        };
        let numa_prefix = rctx
            .prefixes
            .get(NUMA_PREFIX_KEY)
            .unwrap_or("")
            .to_string();

        let nr_errors = manage(&redis_dir, &numa_prefix, Action::Start);
        if nr_errors > 0 {
            return Err(ExecutionError::AuxService(format!(
                "{} error(s) starting the backing service",
                nr_errors
            )));
        }

        Ok(Self {
            redis_dir,
            active: true,
        })
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let nr_errors = manage(&self.redis_dir, "", Action::Stop);
        if nr_errors > 0 {
            warn!("svc: {} error(s) stopping the backing service", nr_errors);
        }
    }
}
