mod local;
mod pbs;
mod slurm;


use crate::context::RunContext;
use itertools::Itertools;
use std::{io::Error, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use slurm::{expand_hostlist, parse_cpus_per_node};

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("Unsupported scheduler: {0}")]
    UnsupportedScheduler(String),
    #[error("Environment variable {0} is not set")]
    MissingVariable(&'static str),
    #[error("Failed to read node file {path:?}")]
    NodeFile {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Malformed value for {name}: {value}")]
    Malformed { name: &'static str, value: String },
    #[error("Scheduler returned an empty node list")]
    NoNodes,
    #[error("Failed to retrieve hostname")]
    Hostname(#[from] nix::Error),
}

/// Access to the allocation of the current job
pub trait ResourceManager {
    const NAME: &'static str;

    fn load(ctx: &RunContext) -> Result<Self, SchedError>
    where
        Self: Sized;

    /// one entry per process slot
    fn get_nodes(&self) -> &[String];

    /// environment the launcher needs to bootstrap on this scheduler
    fn get_launcher_env(&self) -> Vec<(&'static str, String)>;

    fn sched_id(&self) -> &str;
}

/// Supported resource managers, dispatched statically.
#[derive(Clone, Debug)]
pub enum ResourceManagers {
    Local(local::Local),
    Pbs(pbs::Pbs),
    Slurm(slurm::Slurm),
}

impl ResourceManagers {
    /// pick the resource manager of this job, `forced` overrides the environment
    #[instrument(skip(ctx), level = "debug")]
    pub fn detect(ctx: &RunContext, forced: Option<&str>) -> Result<Self, SchedError> {
        let name = match forced {
            Some(name) => name.to_ascii_lowercase(),
            None if ctx.contains("SLURM_JOB_ID") => slurm::Slurm::NAME.to_string(),
            None if ctx.contains("PBS_JOBID") || ctx.contains("PBS_NODEFILE") => {
                pbs::Pbs::NAME.to_string()
            }
            None => local::Local::NAME.to_string(),
        };

        let sched = match name.as_str() {
            "local" => Self::Local(local::Local::load(ctx)?),
            "pbs" => Self::Pbs(pbs::Pbs::load(ctx)?),
            "slurm" => Self::Slurm(slurm::Slurm::load(ctx)?),
            _ => return Err(SchedError::UnsupportedScheduler(name)),
        };

        if sched.get_nodes().is_empty() {
            return Err(SchedError::NoNodes);
        }

        info!(
            sched = sched.name(),
            id = sched.sched_id(),
            slots = sched.get_nodes().len(),
            "Detected scheduler"
        );
        Ok(sched)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => local::Local::NAME,
            Self::Pbs(_) => pbs::Pbs::NAME,
            Self::Slurm(_) => slurm::Slurm::NAME,
        }
    }

    pub fn get_nodes(&self) -> &[String] {
        match self {
            Self::Local(sched) => sched.get_nodes(),
            Self::Pbs(sched) => sched.get_nodes(),
            Self::Slurm(sched) => sched.get_nodes(),
        }
    }

    pub fn get_launcher_env(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Local(sched) => sched.get_launcher_env(),
            Self::Pbs(sched) => sched.get_launcher_env(),
            Self::Slurm(sched) => sched.get_launcher_env(),
        }
    }

    pub fn sched_id(&self) -> &str {
        match self {
            Self::Local(sched) => sched.sched_id(),
            Self::Pbs(sched) => sched.sched_id(),
            Self::Slurm(sched) => sched.sched_id(),
        }
    }

    pub fn is_slurm(&self) -> bool {
        matches!(self, Self::Slurm(_))
    }

    /// unique nodes in allocation order
    pub fn unique_nodes(&self) -> Vec<String> {
        self.get_nodes().iter().unique().cloned().collect()
    }

    /// slots on the first node, what a single host of this job can run
    pub fn cores_per_node(&self) -> usize {
        match self.get_nodes().first() {
            Some(first) => self.get_nodes().iter().filter(|node| *node == first).count(),
            None => 1,
        }
    }
}

/// Apply `--hybrid` and `--double` to the scheduler node list.
pub fn mpinodes(nodes: &[String], hybrid: Option<usize>, double: bool) -> Vec<String> {
    let mut mpinodes = match hybrid {
        Some(per_node) => nodes
            .iter()
            .unique()
            .flat_map(|node| std::iter::repeat(node.clone()).take(per_node))
            .collect_vec(),
        None => nodes.to_vec(),
    };

    if double {
        mpinodes = mpinodes
            .into_iter()
            .flat_map(|node| [node.clone(), node])
            .collect();
    }

    debug!(slots = mpinodes.len(), "MPI nodes");
    mpinodes
}

pub fn hostname() -> Result<String, SchedError> {
    Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned())
}
