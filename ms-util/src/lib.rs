// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Local};
use log::info;
use scan_fmt::scan_fmt;
use simplelog as sl;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;
use std::process::Command;
use std::sync::{Condvar, Mutex};
use std::thread_local;
use std::time::{Duration, UNIX_EPOCH};

pub mod json_file;

pub use json_file::{
    JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave,
};

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().unwrap().as_secs()
}

pub fn format_unix_time(time: u64) -> String {
    DateTime::<Local>::from(UNIX_EPOCH + Duration::from_secs(time))
        .format("%x %T")
        .to_string()
}

pub fn format_duration(dur: f64) -> String {
    if dur >= 60.0 {
        format!("{}m{:02.0}s", dur as u64 / 60, dur % 60.0)
    } else {
        format!("{:.1}s", dur)
    }
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or(anyhow!("File empty"))??)
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            sl::SimpleLogger::init(sl_level, lcfg.build()).unwrap();
        }
    }
}

pub fn run_command(cmd: &mut Command, emsg: &str) -> Result<()> {
    let cmd_str = format!("{:?}", &cmd);

    match cmd.status() {
        Ok(rc) if rc.success() => Ok(()),
        Ok(rc) => bail!("{:?} ({:?}): {}", &cmd_str, &rc, emsg,),
        Err(e) => bail!("{:?} ({:?}): {}", &cmd_str, &e, emsg,),
    }
}

/// Read a flat "KEY VAL" keyed file (/proc/vmstat and friends) into a
/// map. Lines which don't scan are ignored.
pub fn read_flat_keyed_file<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, u64>> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    let mut map = BTreeMap::new();

    for line in r.lines().filter_map(Result::ok) {
        if let Ok((key, val)) = scan_fmt!(&line, "{} {d}", String, u64) {
            map.insert(key, val);
        }
    }
    Ok(map)
}

/// Highest NUMA node id on this machine, from sysfs. A machine without
/// the node directories (!CONFIG_NUMA) reports node 0.
pub fn max_numa_node() -> Result<u32> {
    let mut max = 0;
    match fs::read_dir("/sys/devices/system/node") {
        Ok(entries) => {
            for ent in entries.filter_map(Result::ok) {
                let name = ent.file_name();
                let name = name.to_string_lossy();
                if let Ok(id) = scan_fmt!(&name, "node{d}", u32) {
                    max = max.max(id);
                }
            }
            Ok(max)
        }
        Err(_) => Ok(0),
    }
}

struct GlobalProgState {
    exiting: bool,
    kick_seq: u64,
}

lazy_static::lazy_static! {
    static ref PROG_STATE: Mutex<GlobalProgState> = Mutex::new(GlobalProgState {
        exiting: false,
        kick_seq: 1
    });
    static ref PROG_WAITQ: Condvar = Condvar::new();
}

thread_local! {
    static LOCAL_KICK_SEQ: RefCell<u64> = RefCell::new(0);
}

pub fn setup_prog_state() {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })
    .expect("Error setting term handler");
}

pub fn set_prog_exiting() {
    PROG_STATE.lock().unwrap().exiting = true;
    PROG_WAITQ.notify_all();
}

pub fn prog_exiting() -> bool {
    PROG_STATE.lock().unwrap().exiting
}

pub fn prog_kick() {
    PROG_STATE.lock().unwrap().kick_seq += 1;
    PROG_WAITQ.notify_all();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
    Kicked,
}

pub fn wait_prog_state(dur: Duration) -> ProgState {
    let mut first = true;
    let mut state = PROG_STATE.lock().unwrap();
    loop {
        if state.exiting {
            return ProgState::Exiting;
        }
        if LOCAL_KICK_SEQ.with(|seq| {
            if *seq.borrow() < state.kick_seq {
                *seq.borrow_mut() = state.kick_seq;
                true
            } else {
                false
            }
        }) {
            return ProgState::Kicked;
        }

        if first {
            state = PROG_WAITQ.wait_timeout(state, dur).unwrap().0;
            first = false;
        } else {
            return ProgState::Running;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    #[test]
    fn test_read_flat_keyed_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "numa_hit 10250\n\
             numa_miss 12\n\
             not a keyed line\n\
             numa_local 10238\n"
        )
        .unwrap();
        f.flush().unwrap();

        let map = super::read_flat_keyed_file(f.path()).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["numa_hit"], 10250);
        assert_eq!(map["numa_miss"], 12);
        assert_eq!(map["numa_local"], 10238);
    }

    #[test]
    fn test_format_duration() {
        for pair in &[(0.4, "0.4s"), (59.94, "59.9s"), (61.0, "1m01s"), (3600.0, "60m00s")] {
            let result = super::format_duration(pair.0);
            assert_eq!(&result, pair.1);
        }
    }
}
