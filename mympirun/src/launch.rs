#[cfg(test)]
mod launch_test;

use crate::{
    command::{
        self, make_mpdboot_options, make_mpiexec_options, CommandError, LaunchCommand,
        MpiexecInputs,
    },
    config::{ConfigErrors, RunOptions},
    context::RunContext,
    files::{self, FileError},
    flavor::{what_mpi, Daemon, Flavor, ParamOption, UNTYPED},
    harvest::{
        set_mpiexec_global_options, set_mpiexec_opts_from_env, set_omp_threads,
        MODULE_ENVIRONMENT_VARIABLES,
    },
    network::{self, DeviceError},
    pmi::{probe_srun, PmiAdapter, PmiError, DEFAULT_PMI, DEFAULT_PROBE_TIMEOUT},
    resolve::{which, ResolveError},
    sched::{self, mpinodes, ResourceManagers, SchedError},
};
use itertools::Itertools;
use std::{env, io::Error, path::Path};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Invocation name selecting the srun path
pub const PMIRUN_NAME: &str = "mypmirun";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Sched(#[from] SchedError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Pmi(#[from] PmiError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Failed to determine the working directory")]
    WorkingDirectory(#[source] Error),
}

impl LaunchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Sched(_) | Self::WorkingDirectory(_) => 2,
            Self::Resolve(_) => 3,
            Self::File(_) => 4,
            Self::Device(_) => 5,
            Self::Pmi(_) => 6,
            Self::Command(_) => 7,
        }
    }
}

/// name `what_mpi` should resolve, `--setmpi` accepts flavor names as well as aliases
fn invocation_name(options: &RunOptions, invoked: &str) -> String {
    match &options.setmpi {
        Some(name) => Flavor::by_name(name)
            .and_then(|flavor| flavor.aliases.first())
            .map(|alias| alias.to_string())
            .unwrap_or_else(|| name.clone()),
        None => invoked.to_string(),
    }
}

/// Assemble the `mpirun` command for the detected flavor and scheduler.
#[instrument(skip(ctx, options), level = "info")]
pub fn make_mpirun(
    ctx: &mut RunContext,
    options: &RunOptions,
    invoked: &str,
) -> Result<LaunchCommand, LaunchError> {
    let resolution = what_mpi(ctx, &invocation_name(options, invoked))?;
    let flavor = resolution.flavor.unwrap_or(&UNTYPED);

    let sched = ResourceManagers::detect(ctx, options.setsched.as_deref())?;
    let nodes = mpinodes(sched.get_nodes(), options.hybrid, options.double);
    let unique = nodes.iter().unique().cloned().collect_vec();

    if flavor.daemon == Daemon::Hydra {
        for (name, value) in sched.get_launcher_env() {
            ctx.set_var(name, value);
        }
    }

    let cores = sched.cores_per_node();
    set_omp_threads(ctx, options.ompthreads, cores, options.processes_per_node(cores));

    let selection = network::select_device(flavor, options.forced_device(), unique.len())?;
    let interfaces = match (flavor.netmask_option, flavor.daemon) {
        (ParamOption::None, Daemon::Hydra | Daemon::Orte) => Vec::new(),
        _ => network::list_interfaces()?,
    };
    let netmask = match flavor.netmask_option {
        ParamOption::None => None,
        _ => Some(network::set_netmask(&interfaces, selection.netmasktype)?),
    };

    let basepath = options.basepath.clone().or_else(|| ctx.home());
    let dir = files::make_mympirundir(basepath.as_deref(), sched.sched_id())?;
    let node_file = files::make_node_file(&dir, &nodes)?;

    let mpdboot_options = if flavor.daemon == Daemon::Mpd {
        let mpdboot_file = files::make_mpdboot_file(&dir, &nodes)?;
        let mpd_conf = files::make_mpdboot(&dir)?;
        ctx.set_var("MPD_CONF_FILE", mpd_conf.to_string_lossy());

        let localhosts = network::get_localhosts(&unique, &interfaces, &sched::hostname()?);
        let (localhost, iface) = network::set_mpdboot_localhost_interface(&unique, &localhosts)?;
        debug!(localhost = %localhost, iface = %iface, "mpdboot localhost");

        make_mpdboot_options(unique.len(), &mpdboot_file, &localhost, options.mpdbootverbose)
    } else {
        Vec::new()
    };

    let global_options = set_mpiexec_global_options(ctx, flavor, options);
    let opts_from_env = set_mpiexec_opts_from_env(ctx, flavor, &options.variablesprefix);

    let mpiexec_options = make_mpiexec_options(
        flavor,
        MpiexecInputs {
            node_file: &node_file,
            slots: nodes.len(),
            device: Some(selection.mpidevice),
            netmask: netmask.as_deref(),
            global_options: &global_options,
            opts_from_env: &opts_from_env,
            ctx: &*ctx,
        },
    );

    Ok(LaunchCommand {
        launcher: resolution.launcher,
        mpirunoptions: options.mpirunoptions.clone(),
        mpdboot_options,
        mpiexec_options,
        cmdargs: options.cmd.clone(),
    })
}

/// Assemble an `srun` command, letting srun wire up MPI through a negotiated PMI.
#[instrument(skip(ctx, options), level = "info")]
pub fn make_pmirun(
    ctx: &mut RunContext,
    options: &RunOptions,
    invoked: &str,
) -> Result<LaunchCommand, LaunchError> {
    // srun does its own wire-up, a missing mpirun only costs the flavor preference
    let flavor = match what_mpi(ctx, &invocation_name(options, invoked)) {
        Ok(resolution) => resolution.flavor,
        Err(ResolveError::NotFound(name)) => {
            debug!(name = %name, "No MPI launcher found, using the default PMI preference");
            None
        }
        Err(error) => return Err(error.into()),
    };

    let sched = ResourceManagers::detect(ctx, options.setsched.as_deref())?;
    if !sched.is_slurm() {
        return Err(PmiError::NotSlurm(sched.name()).into());
    }

    let srun = which(ctx, "srun").ok_or_else(|| ResolveError::NotFound("srun".to_string()))?;

    let preferred = if !options.pmi.is_empty() {
        options.pmi.as_slice()
    } else {
        flavor.map_or(DEFAULT_PMI, |flavor| flavor.pmi)
    };
    let mut adapter = PmiAdapter::new(preferred);

    let available = probe_srun(
        &srun,
        ctx,
        options.srun_probe_timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT),
    )?;
    adapter.negotiate(ctx, &available)?;

    let cores = sched.cores_per_node();
    set_omp_threads(ctx, options.ompthreads, cores, options.processes_per_node(cores));

    // srun exports the whole run environment, so global options become plain variables
    if options.noenvmodules {
        for name in MODULE_ENVIRONMENT_VARIABLES {
            ctx.remove_var(name);
        }
    }
    for (name, value) in set_mpiexec_global_options(ctx, flavor.unwrap_or(&UNTYPED), options) {
        ctx.set_var(name, value);
    }
    let forwarded = set_mpiexec_opts_from_env(
        ctx,
        flavor.unwrap_or(&UNTYPED),
        &options.variablesprefix,
    );
    debug!(forwarded = ?forwarded, "Variables reaching the ranks through srun");

    let cwd = env::current_dir().map_err(LaunchError::WorkingDirectory)?;
    let srun_options = adapter.srun_options(&cwd, options.hybrid, options.double)?;

    Ok(LaunchCommand {
        launcher: srun,
        mpirunoptions: options.mpirunoptions.clone(),
        mpdboot_options: Vec::new(),
        mpiexec_options: srun_options,
        cmdargs: options.cmd.clone(),
    })
}

fn show(ctx: &mut RunContext, options: &RunOptions, invoked: &str) -> Result<(), LaunchError> {
    if options.showmpi {
        let resolution = what_mpi(ctx, &invocation_name(options, invoked))?;
        let names = resolution.found.iter().map(|flavor| flavor.name).join(", ");
        match resolution.flavor {
            Some(flavor) => println!(
                "Found MPI flavor {} ({}), known flavors: {names}",
                flavor.name,
                resolution.launcher.display()
            ),
            None => println!(
                "Untyped MPI launcher {}, known flavors: {names}",
                resolution.launcher.display()
            ),
        }
    }

    if options.showsched {
        let sched = ResourceManagers::detect(ctx, options.setsched.as_deref())?;
        println!(
            "Found scheduler {} (job {}, {} slots)",
            sched.name(),
            sched.sched_id(),
            sched.get_nodes().len()
        );
    }

    Ok(())
}

/// Run the full pipeline, returning the exit code of the launcher.
pub fn run(ctx: &mut RunContext, options: &RunOptions, invoked: &str) -> Result<i32, LaunchError> {
    if options.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    if options.showmpi || options.showsched {
        show(ctx, options, invoked)?;
        return Ok(0);
    }

    let scriptname = Path::new(invoked)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| invoked.to_string());

    let cmd = if scriptname == PMIRUN_NAME {
        make_pmirun(ctx, options, invoked)?
    } else {
        make_mpirun(ctx, options, invoked)?
    };

    if options.dry_run {
        println!("{}", cmd.render());
        return Ok(0);
    }

    info!(launcher = ?cmd.launcher, "Launching");
    Ok(command::execute(&cmd.build_command(), ctx)?)
}
