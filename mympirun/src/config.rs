use crate::{context::RunContext, flavor::Flavor, network::Device, pmi::Pmi};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{Error, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, trace, warn};

pub const CONFIG_ENV: &str = "MYMPIRUN_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Run options are invalid, see the errors above")]
    Preflight,
}

/// Site or user defaults, every field is optional
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MympirunConfig {
    pub basepath: Option<PathBuf>,
    #[serde(default)]
    pub variablesprefix: Vec<String>,
    // extra launcher options, split on whitespace
    pub mpirunoptions: Option<String>,
    #[serde(default)]
    pub noenvmodules: bool,
    #[serde(default)]
    pub pinmpi: bool,
    pub setmpi: Option<String>,
    pub setsched: Option<String>,
    #[serde(default)]
    pub pmi: Vec<Pmi>,
    /// seconds to wait for `srun --mpi=list`
    pub srun_probe_timeout: Option<u64>,
}

impl MympirunConfig {
    pub fn default_path(ctx: &RunContext) -> Option<PathBuf> {
        match ctx.var(CONFIG_ENV) {
            Some(path) => Some(PathBuf::from(path)),
            None => ctx
                .home()
                .map(|home| home.join(".config").join("mympirun").join("config.yaml")),
        }
    }

    /// Load the config from `$MYMPIRUN_CONFIG` or the user config directory.
    pub fn open(ctx: &RunContext) -> Result<Self, ConfigErrors> {
        match Self::default_path(ctx) {
            Some(path) => Self::open_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn open_from_path(path: &Path) -> Result<Self, ConfigErrors> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                trace!("'{}' does not exist, using defaults.", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigErrors::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        trace!("Parsing '{}'.", path.display());
        Self::parse_str(path, &content)
    }

    pub fn parse_str(path: &Path, content: &str) -> Result<Self, ConfigErrors> {
        // an empty file is a valid, empty config
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(content).map_err(|source| ConfigErrors::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Everything a single launch is parameterised by
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOptions {
    /// processes per node, overriding the scheduler slots
    pub hybrid: Option<usize>,
    pub double: bool,
    pub ompthreads: Option<usize>,
    pub rdma: bool,
    pub socket: bool,
    pub variablesprefix: Vec<String>,
    pub mpirunoptions: Vec<String>,
    pub noenvmodules: bool,
    pub pinmpi: bool,
    pub mpdbootverbose: bool,
    pub basepath: Option<PathBuf>,
    pub setmpi: Option<String>,
    pub setsched: Option<String>,
    pub pmi: Vec<Pmi>,
    pub srun_probe_timeout: Option<Duration>,
    pub showmpi: bool,
    pub showsched: bool,
    pub dry_run: bool,
    pub cmd: Vec<String>,
}

impl RunOptions {
    /// fill everything the command line left open from the config file
    pub fn merge_config(&mut self, config: MympirunConfig) {
        if self.basepath.is_none() {
            self.basepath = config.basepath;
        }

        let mut prefixes = config.variablesprefix;
        prefixes.append(&mut self.variablesprefix);
        self.variablesprefix = prefixes;

        if self.mpirunoptions.is_empty() {
            if let Some(options) = config.mpirunoptions {
                self.mpirunoptions = options.split_whitespace().map(str::to_string).collect();
            }
        }

        self.noenvmodules |= config.noenvmodules;
        self.pinmpi |= config.pinmpi;

        if self.setmpi.is_none() {
            self.setmpi = config.setmpi;
        }
        if self.setsched.is_none() {
            self.setsched = config.setsched;
        }
        if self.pmi.is_empty() {
            self.pmi = config.pmi;
        }
        if self.srun_probe_timeout.is_none() {
            self.srun_probe_timeout = config.srun_probe_timeout.map(Duration::from_secs);
        }
    }

    pub fn forced_device(&self) -> Option<Device> {
        if self.rdma {
            Some(Device::Ib)
        } else if self.socket {
            Some(Device::Socket)
        } else {
            None
        }
    }

    /// processes per node for thread computations, `slots` when not running hybrid
    pub fn processes_per_node(&self, slots: usize) -> usize {
        let ppn = self.hybrid.unwrap_or(slots);
        if self.double {
            ppn * 2
        } else {
            ppn
        }
    }

    /// Check all options and log every problem, returns true if any was found.
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.rdma && self.socket {
            error!("--rdma and --socket are mutually exclusive");
            contains_error = true;
        }

        if self.hybrid == Some(0) {
            error!("--hybrid needs at least one process per node");
            contains_error = true;
        }

        if self.ompthreads == Some(0) {
            error!("--ompthreads needs at least one thread");
            contains_error = true;
        }

        if self.cmd.is_empty() && !self.showmpi && !self.showsched {
            error!("No command to run was given");
            contains_error = true;
        }

        if let Some(basepath) = &self.basepath {
            if !basepath.is_dir() {
                error!(
                    "basepath {} is not a directory",
                    basepath.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if let Some(name) = &self.setmpi {
            if Flavor::by_name(name).is_none() {
                error!("setmpi '{name}' is not a known MPI flavor");
                contains_error = true;
            }
        }

        if let Some(name) = &self.setsched {
            if !["local", "pbs", "slurm"].contains(&name.to_ascii_lowercase().as_str()) {
                error!("setsched '{name}' is not a supported scheduler, use local, pbs or slurm");
                contains_error = true;
            }
        }

        let unpinned = self
            .setmpi
            .as_deref()
            .and_then(Flavor::by_name)
            .map_or(false, |flavor| flavor.pinning.is_none());
        if self.pinmpi && unpinned {
            warn!("--pinmpi has no effect for this MPI flavor");
        }

        contains_error
    }
}
