use super::{ResourceManager, SchedError};
use crate::context::RunContext;
use itertools::Itertools;
use tracing::{debug, warn};

/// SLURM allocation, parsed once from the job environment
#[derive(Clone, Debug)]
pub struct Slurm {
    nodes: Vec<String>,
    id: String,
}

/// Expand a compressed SLURM hostlist like `node[001-003,007],gpu1`.
pub fn expand_hostlist(hostlist: &str) -> Result<Vec<String>, SchedError> {
    let malformed = || SchedError::Malformed {
        name: "hostlist",
        value: hostlist.to_string(),
    };

    let mut hosts = Vec::new();
    for entry in split_outside_brackets(hostlist).map_err(|_| malformed())? {
        let mut expanded = vec![String::new()];
        let mut rest = entry.as_str();

        while !rest.is_empty() {
            match rest.find('[') {
                Some(open) => {
                    let close = rest[open..].find(']').ok_or_else(malformed)? + open;
                    let prefix = &rest[..open];
                    let ranges = expand_ranges(&rest[open + 1..close]).ok_or_else(malformed)?;

                    expanded = expanded
                        .iter()
                        .cartesian_product(ranges.iter())
                        .map(|(head, range)| format!("{head}{prefix}{range}"))
                        .collect();
                    rest = &rest[close + 1..];
                }
                None => {
                    expanded.iter_mut().for_each(|head| head.push_str(rest));
                    rest = "";
                }
            }
        }

        hosts.extend(expanded.into_iter().filter(|host| !host.is_empty()));
    }

    Ok(hosts)
}

fn split_outside_brackets(hostlist: &str) -> Result<Vec<String>, ()> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in hostlist.trim().chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.checked_sub(1).ok_or(())?,
            ',' if depth == 0 => {
                entries.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }

    if depth != 0 {
        return Err(());
    }
    entries.push(current);

    Ok(entries.into_iter().filter(|entry| !entry.is_empty()).collect())
}

// `001-003,007` -> 001 002 003 007, zero padding follows the lower bound
fn expand_ranges(ranges: &str) -> Option<Vec<String>> {
    let mut values = Vec::new();

    for range in ranges.split(',') {
        match range.split_once('-') {
            Some((low, high)) => {
                let width = low.len();
                let (low, high): (u64, u64) = (low.parse().ok()?, high.parse().ok()?);
                if low > high {
                    return None;
                }
                values.extend((low..=high).map(|value| format!("{value:0width$}")));
            }
            None => {
                range.parse::<u64>().ok()?;
                values.push(range.to_string());
            }
        }
    }

    Some(values)
}

/// Parse the `4(x2),2` format of `SLURM_JOB_CPUS_PER_NODE` into one count per node.
pub fn parse_cpus_per_node(value: &str) -> Result<Vec<usize>, SchedError> {
    let malformed = || SchedError::Malformed {
        name: "SLURM_JOB_CPUS_PER_NODE",
        value: value.to_string(),
    };

    let mut counts = Vec::new();
    for entry in value.trim().split(',').filter(|entry| !entry.is_empty()) {
        match entry.split_once("(x") {
            Some((count, repeat)) => {
                let count: usize = count.parse().map_err(|_| malformed())?;
                let repeat: usize = repeat
                    .strip_suffix(')')
                    .and_then(|repeat| repeat.parse().ok())
                    .ok_or_else(malformed)?;
                counts.extend(std::iter::repeat(count).take(repeat));
            }
            None => counts.push(entry.parse().map_err(|_| malformed())?),
        }
    }

    Ok(counts)
}

impl ResourceManager for Slurm {
    const NAME: &'static str = "slurm";

    fn load(ctx: &RunContext) -> Result<Self, SchedError> {
        let id = ctx
            .var("SLURM_JOB_ID")
            .ok_or(SchedError::MissingVariable("SLURM_JOB_ID"))?
            .to_string();

        let hostlist = ctx
            .var("SLURM_JOB_NODELIST")
            .or_else(|| ctx.var("SLURM_NODELIST"))
            .ok_or(SchedError::MissingVariable("SLURM_JOB_NODELIST"))?;
        let hosts = expand_hostlist(hostlist)?;

        let counts = match ctx
            .var("SLURM_JOB_CPUS_PER_NODE")
            .or_else(|| ctx.var("SLURM_TASKS_PER_NODE"))
        {
            Some(value) => parse_cpus_per_node(value)?,
            None => vec![1; hosts.len()],
        };

        if counts.len() != hosts.len() {
            warn!(
                hosts = hosts.len(),
                counts = counts.len(),
                "Node count and cpus per node disagree, missing entries count as one slot"
            );
        }

        let nodes = hosts
            .iter()
            .enumerate()
            .flat_map(|(index, host)| {
                std::iter::repeat(host.clone()).take(counts.get(index).copied().unwrap_or(1))
            })
            .collect_vec();
        debug!(id = %id, slots = nodes.len(), "SLURM allocation");

        Ok(Self { nodes, id })
    }

    fn get_nodes(&self) -> &[String] {
        &self.nodes
    }

    fn get_launcher_env(&self) -> Vec<(&'static str, String)> {
        vec![("HYDRA_BOOTSTRAP", "slurm".to_string())]
    }

    fn sched_id(&self) -> &str {
        &self.id
    }
}
