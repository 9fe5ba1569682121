// Copyright (c) Facebook, Inc. and its affiliates.
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

/// Heartbeat reporting for a running workload: a live spinner when a
/// user is watching stderr, plain log lines otherwise. Observability
/// only - nothing reads it back.
pub struct HeartbeatProgress {
    bar: Option<ProgressBar>,
}

impl HeartbeatProgress {
    pub fn new() -> Self {
        let bar = match console::user_attended_stderr() {
            true => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
                        .unwrap(),
                );
                bar.tick();
                Some(bar)
            }
            false => None,
        };
        Self { bar }
    }

    pub fn set_status(&mut self, status: &str) {
        match self.bar.as_ref() {
            Some(bar) => bar.set_message(status.to_string()),
            None => info!("{}", status),
        }
    }
}

impl Drop for HeartbeatProgress {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
