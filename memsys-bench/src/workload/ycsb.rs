// Copyright (c) Facebook, Inc. and its affiliates.
use log::debug;

use super::{Family, Workload};
use crate::run::{ExecutionError, RunCtx, RunId, RunRecord};
use crate::service::ServiceGuard;
use crate::telemetry::MeasurementTree;

pub struct Ycsb {}

impl Family for Ycsb {
    fn tag(&self) -> &'static str {
        "ycsb"
    }

    fn format_parameter(&self, name: &str, value: &str) -> String {
        format!("-p {}={}", name, value)
    }

    /// YCSB drives a store which has to be up before the client starts
    /// and torn down afterwards. The guard stops the service on every
    /// exit path.
    fn wrap_execution(
        &self,
        rctx: &mut RunCtx,
        workload: &Workload,
        run: &RunId,
    ) -> Result<RunRecord, ExecutionError> {
        let _redis = ServiceGuard::start(rctx)?;
        rctx.run_workload(workload, run)
    }

    /// Per-operation report lines: "[READ], AverageLatency(us), 379.76".
    fn parse_specific(&self, raw: &str) -> MeasurementTree {
        let mut tree = MeasurementTree::new();

        for line in raw.lines() {
            let line = line.trim();
            if !line.starts_with('[') {
                continue;
            }
            let mut fields = line.split(',').map(str::trim);
            let (op, metric, val) = match (fields.next(), fields.next(), fields.next()) {
                (Some(op), Some(metric), Some(val)) => (op, metric, val),
                _ => continue,
            };
            let op = op.trim_matches(|c| c == '[' || c == ']');
            let val = match val.parse::<f64>() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Err(e) = tree.insert(&[op, metric], val) {
                debug!("ycsb: dropping {:?}/{:?} ({})", op, metric, &e);
            }
        }
        tree
    }
}
