mod intelmpi;
mod mpich;
mod openmpi;


use crate::{
    context::RunContext,
    network::Device,
    pmi::Pmi,
    resolve::{stripfake, which, ResolveError},
};
use itertools::Itertools;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, instrument};

/// How a flavor expects global environment settings and forwarded variables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionStyle {
    /// `-x NAME=VALUE` and `-x NAME`
    OpenMpi,
    /// `-genv NAME VALUE` and a single `-envlist A,B,...`
    Hydra,
    /// `-genv NAME VALUE` for both, forwarded variables carry their current value
    Mpd,
}

/// How a flavor-specific setting (device, netmask) reaches the launcher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamOption {
    /// `--mca <param> <value>`
    Mca(&'static str),
    /// global environment option `<name>=<value>`
    GlobalEnv(&'static str),
    None,
}

/// Major version range a path marker match must fall in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionFilter {
    Below(u32),
    AtLeast(u32),
}

impl VersionFilter {
    pub fn accepts(&self, version: &[u32]) -> bool {
        match (self, version.first()) {
            (Self::Below(bound), Some(major)) => major < bound,
            (Self::AtLeast(bound), Some(major)) => major >= bound,
            (_, None) => false,
        }
    }
}

/// Process manager the launcher relies on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Daemon {
    /// ring of `mpd` daemons booted from a hosts file and `mpd.conf`
    Mpd,
    /// hydra process manager, bootstrapped through the scheduler
    Hydra,
    /// OpenMPI runtime
    Orte,
}

/// Static description of one MPI implementation.
#[derive(Debug)]
pub struct Flavor {
    pub name: &'static str,
    /// invocation names that select this flavor directly
    pub aliases: &'static [&'static str],
    /// install path markers, matched as `<marker>/<version>` in the `mpirun` path
    pub mpirun_for: &'static [&'static str],
    /// restricts `mpirun_for` matches to a version range
    pub version_filter: Option<VersionFilter>,
    /// real launcher executable
    pub launcher: &'static str,
    pub env_prefixes: &'static [&'static str],
    pub device_map: &'static [(Device, &'static str)],
    pub device_option: ParamOption,
    pub netmask_option: ParamOption,
    pub node_file_option: &'static str,
    pub option_style: OptionStyle,
    pub daemon: Daemon,
    /// environment variable toggled by `--pinmpi`
    pub pinning: Option<&'static str>,
    /// PMI preference for the srun path
    pub pmi: &'static [Pmi],
}

/// Registered flavors in priority order, the first flavor claiming a name or path wins.
pub static FLAVORS: &[Flavor] = &[
    openmpi::OPENMPI,
    intelmpi::INTELMPI,
    intelmpi::INTEL_HYDRA_MPI,
    mpich::MPICH2_HYDRA,
    mpich::MVAPICH2_HYDRA,
];

/// Option rendering used when the launcher could not be typed
pub static UNTYPED: Flavor = Flavor {
    name: "untyped",
    aliases: &[],
    mpirun_for: &[],
    version_filter: None,
    launcher: "mpirun",
    env_prefixes: &[],
    device_map: &[
        (Device::Ib, "rdma"),
        (Device::Det, "det"),
        (Device::Shm, "shm"),
        (Device::Socket, "socket"),
    ],
    device_option: ParamOption::None,
    netmask_option: ParamOption::None,
    node_file_option: "-machinefile",
    option_style: OptionStyle::Mpd,
    daemon: Daemon::Hydra,
    pinning: None,
    pmi: &[Pmi::Pmix, Pmi::Pmi2],
};

impl Flavor {
    /// look a flavor up by name or alias, case insensitive
    pub fn by_name(name: &str) -> Option<&'static Flavor> {
        FLAVORS.iter().find(|flavor| {
            flavor.name.eq_ignore_ascii_case(name) || flavor.aliases.contains(&name)
        })
    }

    pub fn is_alias(&self, scriptname: &str) -> bool {
        self.aliases.contains(&scriptname)
    }

    pub fn device(&self, device: Device) -> Option<&'static str> {
        self.device_map
            .iter()
            .find(|(candidate, _)| *candidate == device)
            .map(|(_, value)| *value)
    }

    /// true if `path` looks like the `mpirun` of this flavor
    pub fn is_mpirun_for(&self, path: &Path) -> bool {
        let components = path
            .components()
            .filter_map(|component| match component {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect_vec();

        components
            .windows(2)
            .filter(|pair| self.mpirun_for.contains(&pair[0]) && is_version_directory(pair[1]))
            .any(|pair| match self.version_filter {
                Some(filter) => {
                    let parsed = parse_version(pair[1]);
                    debug!(flavor = self.name, version = ?parsed, "Checking version filter");
                    filter.accepts(&parsed)
                }
                None => true,
            })
    }
}

/// `3.2.2.006`, `1.8.8-GNU` or `4`, but not `bin` or `1x`
fn is_version_directory(name: &str) -> bool {
    let digits = name.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && matches!(name[digits..].chars().next(), None | Some('.' | '-'))
}

/// leading dotted numeric components, `3.2.2.006` -> [3, 2, 2, 6], `1.8.8-GNU` -> [1, 8, 8]
pub fn parse_version(raw: &str) -> Vec<u32> {
    let mut parts = Vec::new();

    for part in raw.split('.') {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse() {
            Ok(number) => parts.push(number),
            Err(_) => break,
        }

        if digits.len() != part.len() {
            break;
        }
    }

    parts
}

/// Outcome of flavor detection
#[derive(Debug, Clone)]
pub struct MpiResolution {
    /// resolved invocation name, or the `mpirun` path for untyped launches
    pub scriptname: PathBuf,
    /// real launcher executable, never mympirun itself
    pub launcher: PathBuf,
    pub flavor: Option<&'static Flavor>,
    /// all candidate flavors
    pub found: &'static [Flavor],
}

fn reject_self(ctx: &RunContext, launcher: PathBuf) -> Result<PathBuf, ResolveError> {
    match (ctx.self_exe(), launcher.canonicalize()) {
        (Some(self_exe), Ok(canonical)) if canonical == self_exe => {
            Err(ResolveError::SelfReference(launcher))
        }
        _ => Ok(launcher),
    }
}

/// Determine which MPI flavor and which real launcher an invocation as `invoked_name` maps to.
#[instrument(skip(ctx), level = "debug")]
pub fn what_mpi(ctx: &mut RunContext, invoked_name: &str) -> Result<MpiResolution, ResolveError> {
    stripfake(ctx);

    let scriptname = Path::new(invoked_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| invoked_name.to_string());

    // called through a known alias like ompirun
    if let Some(flavor) = FLAVORS.iter().find(|flavor| flavor.is_alias(&scriptname)) {
        let launcher = which(ctx, flavor.launcher)
            .ok_or_else(|| ResolveError::NotFound(flavor.launcher.to_string()))?;
        let launcher = reject_self(ctx, launcher)?;
        let scriptname = which(ctx, &scriptname).unwrap_or_else(|| PathBuf::from(invoked_name));

        info!(flavor = flavor.name, launcher = ?launcher, "Selected flavor from alias");

        return Ok(MpiResolution {
            scriptname,
            launcher,
            flavor: Some(flavor),
            found: FLAVORS,
        });
    }

    // not called through an alias, find out which MPI the user has loaded
    let mpirun = which(ctx, "mpirun").ok_or_else(|| ResolveError::NotFound("mpirun".to_string()))?;
    let mpirun = reject_self(ctx, mpirun)?;
    let mpirun_path = mpirun.canonicalize().unwrap_or_else(|_| mpirun.clone());

    let flavor = FLAVORS
        .iter()
        .find(|flavor| flavor.is_mpirun_for(&mpirun) || flavor.is_mpirun_for(&mpirun_path));

    match flavor {
        Some(flavor) => {
            info!(flavor = flavor.name, launcher = ?mpirun, "Selected flavor from mpirun path");

            Ok(MpiResolution {
                scriptname: which(ctx, &scriptname).unwrap_or_else(|| PathBuf::from(invoked_name)),
                launcher: mpirun,
                flavor: Some(flavor),
                found: FLAVORS,
            })
        }
        None => {
            info!(launcher = ?mpirun, "No flavor claims mpirun, running it untyped");

            Ok(MpiResolution {
                scriptname: mpirun.clone(),
                launcher: mpirun,
                flavor: None,
                found: FLAVORS,
            })
        }
    }
}
