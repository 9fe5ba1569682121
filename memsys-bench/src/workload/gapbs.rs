// Copyright (c) Facebook, Inc. and its affiliates.
use super::Family;
use crate::telemetry::MeasurementTree;

pub struct Gapbs {}

impl Family for Gapbs {
    fn tag(&self) -> &'static str {
        "gapbs"
    }

    /// GAP kernels take "--flag value" with a space.
    fn format_parameter(&self, name: &str, value: &str) -> String {
        format!("--{} {}", name, value)
    }

    /// One "Trial Time:" line per kernel trial. The running average
    /// over those lines is computed here, inside a single file; the
    /// reducer's cross-sample averaging is a separate, later pass.
    fn parse_specific(&self, raw: &str) -> MeasurementTree {
        let mut tree = MeasurementTree::new();
        let mut sum = 0.0;
        let mut nr_trials = 0u32;
        let mut running_avg = 0.0;

        for line in raw.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Trial Time:") {
                if let Ok(v) = rest.trim().parse::<f64>() {
                    sum += v;
                    nr_trials += 1;
                    running_avg = sum / nr_trials as f64;
                }
            } else if let Some(rest) = line.strip_prefix("Average Time:") {
                if let Ok(v) = rest.trim().parse::<f64>() {
                    let _ = tree.insert(&["Time", "Reported Average"], v);
                }
            }
        }

        if nr_trials > 0 {
            let _ = tree.insert(&["Time", "Trials"], nr_trials as f64);
            let _ = tree.insert(&["Time", "Trial Average"], running_avg);
        }
        tree
    }
}
