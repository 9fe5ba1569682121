// Copyright (c) Facebook, Inc. and its affiliates.
use quantiles::ckms::CKMS;

use super::Family;
use crate::telemetry::MeasurementTree;

const CKMS_ERROR: f64 = 0.001;

pub struct Tailbench {}

impl Family for Tailbench {
    fn tag(&self) -> &'static str {
        "tailbench"
    }

    /// Tailbench harnesses are knobbed through the environment.
    fn format_parameter(&self, name: &str, value: &str) -> String {
        format!("TBENCH_{}={}", name.to_uppercase(), value)
    }

    /// The integrated harness dumps one "<request> <sojourn-us>" line
    /// per request. Each sample file reduces to its own mean and tail
    /// percentiles; cross-sample averaging happens later in the
    /// reducer.
    fn parse_specific(&self, raw: &str) -> MeasurementTree {
        let mut ckms = CKMS::<f64>::new(CKMS_ERROR);
        let mut lats = vec![];

        for line in raw.lines() {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(req), Some(lat), None) if req.parse::<u64>().is_ok() => {
                    if let Ok(lat) = lat.parse::<f64>() {
                        ckms.insert(lat);
                        lats.push(lat);
                    }
                }
                _ => {}
            }
        }

        let mut tree = MeasurementTree::new();
        if lats.is_empty() {
            return tree;
        }

        let _ = tree.insert(&["Latency", "Requests"], lats.len() as f64);
        let _ = tree.insert(&["Latency", "Mean(us)"], statistical::mean(&lats));
        for (name, pct) in &[("p50(us)", 0.50), ("p95(us)", 0.95), ("p99(us)", 0.99)] {
            if let Some((_, val)) = ckms.query(*pct) {
                let _ = tree.insert(&["Latency", name], val);
            }
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_latencies() {
        let raw = "\
starting up\n\
0 100.0\n\
1 200.0\n\
2 300.0\n\
3 400.0\n\
warmup done extra tokens here\n\
";
        let tree = Tailbench {}.parse_specific(raw);
        assert_eq!(tree.get(&["Latency", "Requests"]), Some(4.0));
        assert_eq!(tree.get(&["Latency", "Mean(us)"]), Some(250.0));
        assert_eq!(tree.get(&["Latency", "p99(us)"]), Some(400.0));
    }

    #[test]
    fn test_no_latency_lines_is_empty() {
        assert!(Tailbench {}.parse_specific("nothing to see\n").is_empty());
    }
}
