// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{debug, warn};
use scan_fmt::scan_fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// NUMA page-placement counters snapshotted around every run. The
/// execution engine appends their deltas to the raw output file and
/// the parser routes them back under System.
pub const VMSTAT_KEYS: &[&str] = &[
    "numa_hit",
    "numa_miss",
    "numa_page_migrated",
    "pgmigrate_success",
    "pgmigrate_fail",
    "numa_local",
    "numa_foreign",
];

/// Nested category -> metric hierarchy. Leaves are numeric, interior
/// nodes are maps - never both at one key. Serializes as plain nested
/// JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementTree {
    Value(f64),
    Branch(BTreeMap<String, MeasurementTree>),
}

impl Default for MeasurementTree {
    fn default() -> Self {
        MeasurementTree::Branch(BTreeMap::new())
    }
}

impl MeasurementTree {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MeasurementTree::Value(_) => false,
            MeasurementTree::Branch(map) => map.is_empty(),
        }
    }

    /// Insert a leaf at `path`. The first shape at a key wins: a leaf
    /// never shadows an existing branch and a branch never descends
    /// through an existing leaf. Shape conflicts are errors for the
    /// caller to log and skip.
    pub fn insert(&mut self, path: &[&str], value: f64) -> Result<()> {
        match self {
            MeasurementTree::Value(_) => bail!("path descends through an existing leaf"),
            MeasurementTree::Branch(map) => match path {
                [] => bail!("empty measurement path"),
                [leaf] => match map.get(*leaf) {
                    Some(MeasurementTree::Branch(_)) => {
                        bail!("leaf {:?} would shadow an existing branch", leaf)
                    }
                    _ => {
                        map.insert(leaf.to_string(), MeasurementTree::Value(value));
                        Ok(())
                    }
                },
                [key, rest @ ..] => map
                    .entry(key.to_string())
                    .or_insert_with(MeasurementTree::new)
                    .insert(rest, value),
            },
        }
    }

    pub fn get(&self, path: &[&str]) -> Option<f64> {
        match (self, path) {
            (MeasurementTree::Value(v), []) => Some(*v),
            (MeasurementTree::Branch(map), [key, rest @ ..]) => map.get(*key)?.get(rest),
            _ => None,
        }
    }

    /// Graft `other` into this tree. On shape conflict the existing
    /// side wins and the conflicting subtree is dropped with a warning.
    pub fn merge(&mut self, other: MeasurementTree) {
        let other = match other {
            MeasurementTree::Branch(map) => map,
            MeasurementTree::Value(_) => {
                warn!("telemetry: cannot merge a bare leaf into a tree");
                return;
            }
        };
        if let MeasurementTree::Branch(map) = self {
            for (key, sub) in other {
                if !map.contains_key(&key) {
                    map.insert(key, sub);
                    continue;
                }
                let existing = map.get_mut(&key).unwrap();
                match (&*existing, &sub) {
                    (MeasurementTree::Branch(_), MeasurementTree::Branch(_)) => {
                        existing.merge(sub)
                    }
                    (MeasurementTree::Value(_), _) => {
                        warn!("telemetry: dropping duplicate entry {:?}", &key)
                    }
                    (MeasurementTree::Branch(_), MeasurementTree::Value(_)) => {
                        warn!("telemetry: dropping leaf {:?} shadowing a branch", &key)
                    }
                }
            }
        }
    }
}

/// Parse one monitoring source's three-row counter table. A missing or
/// unreadable file is a parse error for the caller; bad cells inside
/// the table never are.
pub fn parse_counter_csv(path: &Path) -> Result<MeasurementTree> {
    let buf = fs::read_to_string(path)?;
    Ok(parse_counter_table(&buf))
}

/// Row 0 carries categories, row 1 sub-categories and row 2 the values,
/// one column per counter. The monitor emits merged header spans as
/// empty cells, so an empty category inherits the one to its left.
pub fn parse_counter_table(buf: &str) -> MeasurementTree {
    let mut tree = MeasurementTree::new();

    let mut rows: Vec<Vec<String>> = buf
        .lines()
        .take(3)
        .map(|line| line.split(',').map(clean_cell).collect())
        .collect();
    if rows.len() < 3 {
        warn!("telemetry: counter table has {} row(s), need 3", rows.len());
        return tree;
    }

    let mut carried = String::new();
    for cell in rows[0].iter_mut() {
        if cell.is_empty() {
            *cell = carried.clone();
        } else {
            carried = cell.clone();
        }
    }

    let (cats, subs, vals) = (&rows[0], &rows[1], &rows[2]);
    for (idx, cell) in vals.iter().enumerate() {
        let val = match cell.parse::<f64>() {
            Ok(v) => v,
            Err(_) => {
                debug!("telemetry: skipping non-numeric cell {:?} (column {})", cell, idx);
                continue;
            }
        };
        let cat = cats.get(idx).map(String::as_str).unwrap_or("");
        let sub = subs.get(idx).map(String::as_str).unwrap_or("");
        if let Err(e) = route_column(&mut tree, cat, sub, val) {
            debug!("telemetry: dropping column {} ({})", idx, &e);
        }
    }
    tree
}

fn clean_cell(cell: &str) -> String {
    cell.trim().trim_matches('"').trim().to_string()
}

fn route_column(tree: &mut MeasurementTree, cat: &str, sub: &str, val: f64) -> Result<()> {
    if cat.contains("System") {
        let area = cat.replacen("System", "", 1);
        let area = area.trim();
        if area.is_empty() {
            return tree.insert(&["System", sub], val);
        }
        return tree.insert(&["System", area, sub], val);
    }

    if cat.contains("Socket") {
        // "<metric> (Socket N)" puts per-core metrics under the socket.
        if let Some((metric, sock)) = split_paren_socket(cat) {
            let sock_key = format!("Socket {}", sock);
            return tree.insert(&["System", "Sockets", &sock_key, "Cores", &metric, sub], val);
        }
        // Bare "Socket N".
        if let Some(rest) = cat.strip_prefix("Socket ") {
            if rest.trim().parse::<u32>().is_ok() {
                return tree.insert(&["System", "Sockets", cat, sub], val);
            }
        }
    }

    if let Some(rest) = cat.strip_prefix("SKT") {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            let sock_key = format!("Socket {}", &digits);
            let area = rest[digits.len()..].trim();
            if !area.is_empty() {
                return tree.insert(&["System", "Sockets", &sock_key, area, sub], val);
            }
            return route_socket_subcat(tree, &sock_key, sub, val);
        }
    }

    // A row-1 sub-category of the literal form "SKTn" assigns the whole
    // column to socket n; the category is then the metric name.
    if let Some(rest) = sub.strip_prefix("SKT") {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            let sock_key = format!("Socket {}", rest);
            return tree.insert(&["System", "Sockets", &sock_key, cat], val);
        }
    }

    bail!("unroutable category {:?} / sub-category {:?}", cat, sub)
}

/// "<metric> (Socket N)" -> (metric, N).
fn split_paren_socket(cat: &str) -> Option<(String, u32)> {
    let open = cat.rfind("(Socket")?;
    let close = open + cat[open..].find(')')?;
    let sock = cat[open + "(Socket".len()..close].trim().parse::<u32>().ok()?;
    let metric = cat[..open].trim();
    if metric.is_empty() {
        return None;
    }
    Some((metric.to_string(), sock))
}

/// Channel and memory-controller columns carry their index inside the
/// sub-category ("Ch0Read", "iMC1 Writes"). Tokenize into alphabetic
/// and numeric runs to find it; anything else lands in a flat slot
/// under the socket.
fn route_socket_subcat(
    tree: &mut MeasurementTree,
    sock_key: &str,
    sub: &str,
    val: f64,
) -> Result<()> {
    let tokens = split_runs(sub);

    for i in 0..tokens.len() {
        let group = match tokens[i].as_str() {
            "Ch" => ("Channels", "Channel"),
            "iMC" => ("iMCs", "iMC"),
            _ => continue,
        };
        if i + 1 >= tokens.len() || !tokens[i + 1].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        let member = format!("{} {}", group.1, &tokens[i + 1]);
        let remaining = tokens
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i && *j != i + 1)
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if remaining.is_empty() {
            break;
        }
        return tree.insert(
            &["System", "Sockets", sock_key, group.0, &member, &remaining],
            val,
        );
    }

    tree.insert(&["System", "Sockets", sock_key, sub], val)
}

fn split_runs(s: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut cur = String::new();
    let mut alpha = false;

    for ch in s.chars() {
        if !ch.is_ascii_alphanumeric() {
            if !cur.is_empty() {
                tokens.push(std::mem::replace(&mut cur, String::new()));
            }
            continue;
        }
        if !cur.is_empty() && ch.is_ascii_alphabetic() != alpha {
            tokens.push(std::mem::replace(&mut cur, String::new()));
        }
        alpha = ch.is_ascii_alphabetic();
        cur.push(ch);
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

/// Pick the OS counter deltas the execution engine appended back out of
/// the raw output. Only the engine's known keys are accepted - the
/// workload's own stdout may contain arbitrary "a = b" text.
pub fn parse_delta_lines(raw: &str) -> MeasurementTree {
    let mut tree = MeasurementTree::new();
    for line in raw.lines() {
        if let Ok((key, val)) = scan_fmt!(line, "{} = {d}", String, i64) {
            if VMSTAT_KEYS.contains(&key.as_str()) {
                if let Err(e) = tree.insert(&["System", &key], val as f64) {
                    debug!("telemetry: {}", &e);
                }
            }
        }
    }
    tree
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&str]) -> MeasurementTree {
        parse_counter_table(&rows.join("\n"))
    }

    #[test]
    fn test_system_and_core_routing() {
        let tree = table(&[
            "System,Socket 0 (Socket 0)",
            "Freq,Instructions",
            "3.2,12000",
        ]);
        assert_eq!(tree.get(&["System", "Freq"]), Some(3.2));
        assert_eq!(
            tree.get(&[
                "System",
                "Sockets",
                "Socket 0",
                "Cores",
                "Socket 0",
                "Instructions"
            ]),
            Some(12000.0)
        );
    }

    #[test]
    fn test_system_area_and_bare_socket() {
        let tree = table(&[
            "System Core C-States,Socket 1",
            "C0res%,Freq",
            "55.5,2.8",
        ]);
        assert_eq!(tree.get(&["System", "Core C-States", "C0res%"]), Some(55.5));
        assert_eq!(
            tree.get(&["System", "Sockets", "Socket 1", "Freq"]),
            Some(2.8)
        );
    }

    #[test]
    fn test_skt_routing() {
        let tree = table(&[
            "SKT0 Core C-State,SKT0,SKT0,SKT1",
            "C6res%,Ch0Read,iMC1 Writes,Memory (MB/s)",
            "12.5,1000,2000,3000",
        ]);
        assert_eq!(
            tree.get(&["System", "Sockets", "Socket 0", "Core C-State", "C6res%"]),
            Some(12.5)
        );
        assert_eq!(
            tree.get(&[
                "System",
                "Sockets",
                "Socket 0",
                "Channels",
                "Channel 0",
                "Read"
            ]),
            Some(1000.0)
        );
        assert_eq!(
            tree.get(&["System", "Sockets", "Socket 0", "iMCs", "iMC 1", "Writes"]),
            Some(2000.0)
        );
        // No channel or controller index: flat slot under the socket.
        assert_eq!(
            tree.get(&["System", "Sockets", "Socket 1", "Memory (MB/s)"]),
            Some(3000.0)
        );
    }

    #[test]
    fn test_skt_shorthand_in_sub_category() {
        let tree = table(&[
            "Proc Energy (Joules),Proc Energy (Joules)",
            "SKT0,SKT1",
            "20.5,30.5",
        ]);
        assert_eq!(
            tree.get(&["System", "Sockets", "Socket 0", "Proc Energy (Joules)"]),
            Some(20.5)
        );
        assert_eq!(
            tree.get(&["System", "Sockets", "Socket 1", "Proc Energy (Joules)"]),
            Some(30.5)
        );
    }

    #[test]
    fn test_category_carry_forward_and_bad_cells() {
        let tree = table(&[
            "System,,Date",
            "Freq,IPC,Date",
            "3.2,1.5,2024-06-01",
        ]);
        assert_eq!(tree.get(&["System", "Freq"]), Some(3.2));
        assert_eq!(tree.get(&["System", "IPC"]), Some(1.5));
        // The date column neither parses nor routes.
        assert_eq!(tree.get(&["Date", "Date"]), None);
    }

    #[test]
    fn test_short_table_is_empty() {
        assert!(table(&["System", "Freq"]).is_empty());
    }

    #[test]
    fn test_delta_lines() {
        let raw = "\
benchmark output line\n\
throughput = 4000\n\
numa_hit = 10250\n\
numa_miss = -3\n";
        let tree = parse_delta_lines(raw);
        assert_eq!(tree.get(&["System", "numa_hit"]), Some(10250.0));
        assert_eq!(tree.get(&["System", "numa_miss"]), Some(-3.0));
        // Not an engine counter key.
        assert_eq!(tree.get(&["System", "throughput"]), None);
    }

    #[test]
    fn test_insert_shape_conflicts() {
        let mut tree = MeasurementTree::new();
        tree.insert(&["System", "Freq"], 3.2).unwrap();
        assert!(tree.insert(&["System", "Freq", "deeper"], 1.0).is_err());
        assert!(tree.insert(&["System"], 1.0).is_err());
    }
}
