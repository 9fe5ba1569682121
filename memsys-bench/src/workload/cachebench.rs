// Copyright (c) Facebook, Inc. and its affiliates.
use super::Family;

pub struct Cachebench {}

impl Family for Cachebench {
    fn tag(&self) -> &'static str {
        "cachebench"
    }
}
