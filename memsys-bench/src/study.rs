// Copyright (c) Facebook, Inc. and its affiliates.
use log::warn;
use std::collections::BTreeMap;

use crate::telemetry::MeasurementTree;

/// Compound-key separator. Never appears in a category or metric name
/// produced by this system, which keeps flatten/unflatten a proper
/// round trip.
pub const PATH_SEP: char = '/';

pub fn flatten(tree: &MeasurementTree) -> Vec<(String, f64)> {
    let mut pairs = vec![];
    walk(tree, String::new(), &mut pairs);
    pairs
}

fn walk(tree: &MeasurementTree, prefix: String, out: &mut Vec<(String, f64)>) {
    match tree {
        MeasurementTree::Value(v) => out.push((prefix, *v)),
        MeasurementTree::Branch(map) => {
            for (key, sub) in map.iter() {
                let compound = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}{}{}", prefix, PATH_SEP, key)
                };
                walk(sub, compound, out);
            }
        }
    }
}

pub fn unflatten<I: IntoIterator<Item = (String, f64)>>(pairs: I) -> MeasurementTree {
    let mut root = MeasurementTree::new();
    for (key, val) in pairs {
        let path: Vec<&str> = key.split(PATH_SEP).collect();
        if let Err(e) = root.insert(&path, val) {
            warn!("study: dropping {:?} ({})", &key, &e);
        }
    }
    root
}

/// Average repeated samples of the same measurement. Each compound key
/// is divided by its own presence count - a metric reported in only k
/// of n samples averages over k - and rounded to two decimals.
pub fn average<'a, I>(samples: I) -> MeasurementTree
where
    I: IntoIterator<Item = &'a MeasurementTree>,
{
    let mut acc: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for tree in samples {
        for (key, val) in flatten(tree) {
            acc.entry(key).or_insert_with(Vec::new).push(val);
        }
    }

    unflatten(acc.into_iter().map(|(key, vals)| {
        let mean = statistical::mean(&vals);
        (key, (mean * 100.0).round() / 100.0)
    }))
}
