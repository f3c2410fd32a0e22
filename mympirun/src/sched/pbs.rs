use super::{ResourceManager, SchedError};
use crate::context::RunContext;
use std::{fs, path::PathBuf};
use tracing::debug;

/// Torque/PBS allocation from `$PBS_NODEFILE`
#[derive(Clone, Debug)]
pub struct Pbs {
    nodes: Vec<String>,
    id: String,
}

impl ResourceManager for Pbs {
    const NAME: &'static str = "pbs";

    fn load(ctx: &RunContext) -> Result<Self, SchedError> {
        let path = ctx
            .var("PBS_NODEFILE")
            .map(PathBuf::from)
            .ok_or(SchedError::MissingVariable("PBS_NODEFILE"))?;

        let content = fs::read_to_string(&path).map_err(|source| SchedError::NodeFile {
            path: path.clone(),
            source,
        })?;

        let nodes: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(path = ?path, slots = nodes.len(), "Read PBS node file");

        Ok(Self {
            nodes,
            id: ctx
                .var("PBS_JOBID")
                .map(str::to_string)
                .unwrap_or_else(|| format!("pbs_{}", std::process::id())),
        })
    }

    fn get_nodes(&self) -> &[String] {
        &self.nodes
    }

    fn get_launcher_env(&self) -> Vec<(&'static str, String)> {
        vec![("HYDRA_BOOTSTRAP", "pbs".to_string())]
    }

    fn sched_id(&self) -> &str {
        &self.id
    }
}
