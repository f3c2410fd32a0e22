use crate::context::RunContext;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    io::{Error, ErrorKind, Read},
    path::Path,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// Process management interface flavours srun can bootstrap MPI with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Pmi {
    Pmix,
    Pmi2,
}

impl Pmi {
    pub const fn flavour(&self) -> &'static str {
        match self {
            Self::Pmix => "pmix",
            Self::Pmi2 => "pmi2",
        }
    }

    /// exact plugin name or a versioned one like `pmix_v3`
    pub fn matches(&self, plugin: &str) -> bool {
        let flavour = self.flavour();
        plugin == flavour
            || plugin
                .strip_prefix(flavour)
                .and_then(|rest| rest.strip_prefix("_v"))
                .map_or(false, |version| {
                    !version.is_empty() && version.chars().all(|c| c.is_ascii_digit())
                })
    }
}

pub const DEFAULT_PMI: &[Pmi] = &[Pmi::Pmix, Pmi::Pmi2];

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Allocation variables that conflict with an explicit srun geometry
pub const SLURM_UNSET_VARIABLES: [&str; 7] = [
    "SLURM_CPUS_ON_NODE",
    "SLURM_JOB_CPUS_PER_NODE",
    "SLURM_MEM_PER_CPU",
    "SLURM_NNODES",
    "SLURM_NPROCS",
    "SLURM_NTASKS",
    "SLURM_JOB_NUM_NODES",
];

static MPI_PLUGIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(none|cray_shasta|pmi2|pmix(?:_v\d+)?)\b").expect("static regex")
});

#[derive(Error, Debug)]
pub enum PmiError {
    #[error("None of the requested PMI flavours ({requested}) is supported by srun (available: {available})")]
    Unsupported { requested: String, available: String },
    #[error("PMI flavour was already negotiated as {0}")]
    AlreadyNegotiated(&'static str),
    #[error("PMI flavour has not been negotiated yet")]
    NotNegotiated,
    #[error("The srun launcher requires a SLURM allocation, found {0}")]
    NotSlurm(&'static str),
    #[error("Failed to run {cmd}")]
    Probe {
        cmd: String,
        #[source]
        source: Error,
    },
    #[error("{0} did not answer within {1:?}")]
    ProbeTimeout(String, Duration),
}

/// Allocation geometry captured before the conflicting variables are removed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlurmSnapshot {
    pub nodes: Option<usize>,
    pub ntasks: Option<usize>,
    pub cpus_on_node: Option<usize>,
    pub mem_per_cpu: Option<String>,
}

impl SlurmSnapshot {
    pub fn capture(ctx: &RunContext) -> Self {
        let number = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| ctx.var(name))
                .and_then(|value| value.trim().parse().ok())
        };

        Self {
            nodes: number(&["SLURM_NNODES", "SLURM_JOB_NUM_NODES"]),
            ntasks: number(&["SLURM_NTASKS", "SLURM_NPROCS"]),
            cpus_on_node: number(&["SLURM_CPUS_ON_NODE"]),
            mem_per_cpu: ctx.var("SLURM_MEM_PER_CPU").map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PmiState {
    Unnegotiated,
    Negotiated { pmi: Pmi, snapshot: SlurmSnapshot },
}

#[derive(Clone, Debug)]
pub struct PmiAdapter {
    preferred: Vec<Pmi>,
    state: PmiState,
}

/// plugin names from `srun --mpi=list`, in order of appearance
pub fn parse_mpi_list(output: &str) -> Vec<String> {
    MPI_PLUGIN
        .captures_iter(output)
        .filter_map(|captures| captures.get(1))
        .map(|plugin| plugin.as_str().to_string())
        .unique()
        .collect()
}

// read a child pipe to the end on its own thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Result<String, Error>> {
    thread::spawn(move || -> Result<String, Error> {
        let mut output = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut output)?;
        }
        Ok(output)
    })
}

fn collect(reader: JoinHandle<Result<String, Error>>) -> Result<String, Error> {
    reader
        .join()
        .unwrap_or_else(|_| Err(Error::new(ErrorKind::Other, "pipe reader panicked")))
}

/// Ask `srun` which MPI plugins it supports.
#[instrument(skip(ctx), level = "debug")]
pub fn probe_srun(srun: &Path, ctx: &RunContext, timeout: Duration) -> Result<Vec<String>, PmiError> {
    let cmd = format!("{} --mpi=list", srun.display());

    let mut child = Command::new(srun)
        .arg("--mpi=list")
        .env_clear()
        .envs(ctx.vars())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| PmiError::Probe { cmd: cmd.clone(), source })?;

    // drained while waiting, a full pipe would stall srun past the timeout
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    match child.wait_timeout(timeout) {
        Ok(Some(status)) => {
            if !status.success() {
                warn!(status = ?status, "{cmd} exited unsuccessfully, parsing its output anyway");
            }
        }
        Ok(None) => {
            // child hasn't exited yet
            if let Err(error) = child.kill() {
                warn!(error = ?error, "Failed to kill {cmd}");
            }
            let _ = child.wait();
            return Err(PmiError::ProbeTimeout(cmd, timeout));
        }
        Err(source) => return Err(PmiError::Probe { cmd, source }),
    }

    // older srun versions print the list on stderr
    let mut output = collect(stdout).map_err(|source| PmiError::Probe { cmd: cmd.clone(), source })?;
    output.push_str(&collect(stderr).map_err(|source| PmiError::Probe { cmd: cmd.clone(), source })?);

    let plugins = parse_mpi_list(&output);
    debug!(plugins = ?plugins, "srun MPI plugins");

    Ok(plugins)
}

impl PmiAdapter {
    pub fn new(preferred: &[Pmi]) -> Self {
        Self {
            preferred: preferred.to_vec(),
            state: PmiState::Unnegotiated,
        }
    }

    pub fn state(&self) -> &PmiState {
        &self.state
    }

    pub fn pmi(&self) -> Option<Pmi> {
        match self.state {
            PmiState::Negotiated { pmi, .. } => Some(pmi),
            PmiState::Unnegotiated => None,
        }
    }

    /// Pick the first preferred PMI that srun offers and clear the conflicting allocation
    /// variables from `ctx`. One-way: a second negotiation fails.
    pub fn negotiate(&mut self, ctx: &mut RunContext, available: &[String]) -> Result<Pmi, PmiError> {
        if let PmiState::Negotiated { pmi, .. } = self.state {
            return Err(PmiError::AlreadyNegotiated(pmi.flavour()));
        }

        let pmi = self
            .preferred
            .iter()
            .copied()
            .find(|pmi| available.iter().any(|plugin| pmi.matches(plugin)))
            .ok_or_else(|| PmiError::Unsupported {
                requested: self.preferred.iter().map(Pmi::flavour).join(","),
                available: available.join(","),
            })?;

        let snapshot = SlurmSnapshot::capture(ctx);
        for name in SLURM_UNSET_VARIABLES {
            if let Some(value) = ctx.remove_var(name) {
                debug!(name = name, value = %value, "Unset scheduler variable");
            }
        }

        info!(pmi = pmi.flavour(), snapshot = ?snapshot, "Negotiated PMI");
        self.state = PmiState::Negotiated { pmi, snapshot };

        Ok(pmi)
    }

    /// srun geometry and PMI options, only available once negotiated
    pub fn srun_options(
        &self,
        cwd: &Path,
        hybrid: Option<usize>,
        double: bool,
    ) -> Result<Vec<String>, PmiError> {
        let (pmi, snapshot) = match &self.state {
            PmiState::Negotiated { pmi, snapshot } => (pmi, snapshot),
            PmiState::Unnegotiated => return Err(PmiError::NotNegotiated),
        };

        let mut options = vec![
            format!("--chdir={}", cwd.display()),
            format!("--mpi={}", pmi.flavour()),
        ];

        if let Some(nodes) = snapshot.nodes {
            options.push(format!("--nodes={nodes}"));
        }

        let factor = if double { 2 } else { 1 };
        match (hybrid, snapshot.nodes) {
            (Some(per_node), Some(nodes)) => {
                let per_node = per_node * factor;
                options.push(format!("--ntasks={}", nodes * per_node));
                options.push(format!("--ntasks-per-node={per_node}"));
                if let Some(cpus) = snapshot.cpus_on_node {
                    options.push(format!("--cpus-per-task={}", (cpus / per_node).max(1)));
                }
            }
            _ => {
                if let Some(ntasks) = snapshot.ntasks {
                    options.push(format!("--ntasks={}", ntasks * factor));
                }
            }
        }

        if let Some(mem) = &snapshot.mem_per_cpu {
            options.push(format!("--mem-per-cpu={mem}"));
        }

        Ok(options)
    }
}
