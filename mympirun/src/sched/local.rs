use super::{hostname, ResourceManager, SchedError};
use crate::context::RunContext;
use tracing::{debug, warn};

/// Runs on the current host only
#[derive(Clone, Debug)]
pub struct Local {
    nodes: Vec<String>,
    id: String,
}

/// cores this process may run on, the whole machine if the affinity mask is unavailable
pub fn usable_cores() -> usize {
    let cores = match affinity::get_thread_affinity() {
        Ok(cores) if !cores.is_empty() => cores.len(),
        Ok(_) => affinity::get_core_num(),
        Err(error) => {
            warn!(error = ?error, "Failed to read CPU affinity, using all cores");
            affinity::get_core_num()
        }
    };

    cores.max(1)
}

impl ResourceManager for Local {
    const NAME: &'static str = "local";

    fn load(_ctx: &RunContext) -> Result<Self, SchedError> {
        let hostname = hostname()?;
        let cores = usable_cores();
        debug!(hostname = %hostname, cores = cores, "Local allocation");

        Ok(Self {
            nodes: vec![hostname; cores],
            id: format!("local_{}", std::process::id()),
        })
    }

    fn get_nodes(&self) -> &[String] {
        &self.nodes
    }

    fn get_launcher_env(&self) -> Vec<(&'static str, String)> {
        vec![("HYDRA_BOOTSTRAP", "fork".to_string())]
    }

    fn sched_id(&self) -> &str {
        &self.id
    }
}
