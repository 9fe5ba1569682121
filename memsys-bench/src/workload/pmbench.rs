// Copyright (c) Facebook, Inc. and its affiliates.
use std::collections::BTreeMap;

use super::Family;
use crate::telemetry::MeasurementTree;

pub struct Pmbench {}

impl Family for Pmbench {
    fn tag(&self) -> &'static str {
        "pmbench"
    }

    /// pmbench calls its thread count "jobs" and takes the measurement
    /// duration as a bare trailing argument.
    fn format_parameter(&self, name: &str, value: &str) -> String {
        match name {
            "threads" => format!("--jobs={}", value),
            "time" => value.to_string(),
            _ => format!("--{}={}", name, value),
        }
    }

    /// Access latency histogram, log2 buckets with a variable number of
    /// sub-buckets each:
    ///
    ///   [Read]
    ///   2^08:
    ///     0: 1234
    ///     1: 567
    ///
    /// Sub-bucket counts land under Histogram -> op -> bucket, with a
    /// per-bucket Total alongside them.
    fn parse_specific(&self, raw: &str) -> MeasurementTree {
        let mut tree = MeasurementTree::new();
        let mut op = "Access".to_string();
        let mut bucket: Option<String> = None;
        let mut totals: BTreeMap<(String, String), f64> = BTreeMap::new();

        for line in raw.lines() {
            let line = line.trim();

            if line.starts_with('[') && line.ends_with(']') {
                op = line.trim_matches(|c| c == '[' || c == ']').to_string();
                bucket = None;
                continue;
            }
            if line.starts_with("2^") {
                bucket = Some(line.trim_end_matches(':').to_string());
                continue;
            }

            let bkt = match bucket.as_ref() {
                Some(v) => v,
                None => continue,
            };
            let mut fields = line.splitn(2, ':');
            let (idx, count) = match (fields.next(), fields.next()) {
                (Some(idx), Some(count)) => (idx.trim(), count.trim()),
                _ => continue,
            };
            if idx.is_empty() || !idx.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(count) = count.parse::<f64>() {
                let _ = tree.insert(&["Histogram", &op, bkt, idx], count);
                *totals.entry((op.clone(), bkt.clone())).or_insert(0.0) += count;
            }
        }

        for ((op, bkt), total) in totals.iter() {
            let _ = tree.insert(&["Histogram", op, bkt, "Total"], *total);
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_histogram() {
        let raw = "\
pmbench rand 60s\n\
[Read]\n\
2^08:\n\
  0: 100\n\
  1: 200\n\
  2: 300\n\
2^09:\n\
  0: 50\n\
[Write]\n\
2^08:\n\
  0: 10\n\
stray text\n\
";
        let tree = Pmbench {}.parse_specific(raw);
        assert_eq!(tree.get(&["Histogram", "Read", "2^08", "1"]), Some(200.0));
        assert_eq!(tree.get(&["Histogram", "Read", "2^08", "Total"]), Some(600.0));
        assert_eq!(tree.get(&["Histogram", "Read", "2^09", "0"]), Some(50.0));
        assert_eq!(tree.get(&["Histogram", "Read", "2^09", "Total"]), Some(50.0));
        assert_eq!(tree.get(&["Histogram", "Write", "2^08", "Total"]), Some(10.0));
    }

    #[test]
    fn test_counts_outside_a_bucket_are_ignored() {
        let tree = Pmbench {}.parse_specific("0: 100\n1: 200\n");
        assert!(tree.is_empty());
    }
}
