//! Processor and NUMA topology discovery from sysfs.
//!
//! Every lookup has an `_at` variant taking the sysfs `devices/system` root
//! so that the parsing can be exercised against a fake tree.

use log::debug;
use serde::Serialize;
use std::path::Path;
use walkdir::WalkDir;

const SYSTEM_ROOT: &str = "/sys/devices/system";

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Walk(walkdir::Error),
    /// A processor list that does not follow the kernel list format.
    CpuList(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Walk(e) => write!(f, "sysfs walk error: {e}"),
            Self::CpuList(s) => write!(f, "malformed cpu list: {s:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Walk(e) => Some(e),
            Self::CpuList(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Self::Walk(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A NUMA node and the processors local to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: usize,
    pub cpus: Vec<usize>,
}

/// Parses the kernel processor list format, eg: `0-3,8,10-11`.
///
/// The result is sorted and deduplicated. An empty (or whitespace only)
/// list is valid and yields no processors.
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();

    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        let bad = || Error::CpuList(list.to_string());

        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().map_err(|_| bad())?;
                let end: usize = end.trim().parse().map_err(|_| bad())?;
                if end < start {
                    return Err(bad());
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.trim().parse().map_err(|_| bad())?),
        }
    }

    cpus.sort_unstable();
    cpus.dedup();

    Ok(cpus)
}

/// Returns the ids of all online processors.
pub fn online_cpus() -> Result<Vec<usize>> {
    online_cpus_at(Path::new(SYSTEM_ROOT))
}

pub fn online_cpus_at(root: &Path) -> Result<Vec<usize>> {
    let list = std::fs::read_to_string(root.join("cpu/online"))?;
    parse_cpulist(&list)
}

/// Returns the NUMA nodes of this machine, ordered by node id.
pub fn numa_nodes() -> Result<Vec<Node>> {
    numa_nodes_at(Path::new(SYSTEM_ROOT))
}

pub fn numa_nodes_at(root: &Path) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();

    for entry in WalkDir::new(root.join("node"))
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
    {
        let entry = entry?;

        let id = match entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix("node"))
            .and_then(|id| id.parse::<usize>().ok())
        {
            Some(id) => id,
            None => continue,
        };

        let cpulist = entry.path().join("cpulist");
        if !cpulist.exists() {
            debug!("node{id} has no cpulist, skipping");
            continue;
        }

        let cpus = parse_cpulist(&std::fs::read_to_string(cpulist)?)?;
        nodes.push(Node { id, cpus });
    }

    nodes.sort_by_key(|n| n.id);

    Ok(nodes)
}
