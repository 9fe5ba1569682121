// Copyright (c) Facebook, Inc. and its affiliates.
mod args;
mod config;

pub use args::Args;
pub use config::{
    scalar_to_string, Config, ExperimentKnobs, GeneralKnobs, Operation, Paths, PlacementKnobs,
    ScriptKnobs, WorkloadKnobs, NUMA_PREFIX_KEY,
};
