mod command;
mod config;
mod context;
mod files;
mod flavor;
mod harvest;
mod launch;
mod network;
mod pmi;
mod resolve;
mod sched;

#[cfg(test)]
mod testutil;

use clap::Parser;
use config::{MympirunConfig, RunOptions};
use context::RunContext;
use launch::LaunchError;
use pmi::Pmi;
use std::{env, path::PathBuf, process::exit, time::Duration};
use tracing::{debug, error};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Launch MPI programs with the right launcher, options and environment for this job
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Run this many processes per node instead of one per scheduler slot
    #[arg(long)]
    hybrid: Option<usize>,

    /// Run two processes per slot
    #[arg(long)]
    double: bool,

    /// Number of OpenMP threads per process
    #[arg(long)]
    ompthreads: Option<usize>,

    /// Force the infiniband interconnect
    #[arg(long, conflicts_with = "socket")]
    rdma: bool,

    /// Force communication over sockets
    #[arg(long)]
    socket: bool,

    /// Forward all variables starting with one of these prefixes (comma separated)
    #[arg(long, value_delimiter = ',')]
    variablesprefix: Vec<String>,

    /// Extra options passed to the launcher verbatim
    #[arg(long, allow_hyphen_values = true)]
    mpirunoptions: Option<String>,

    /// Don't pass the environment modules setup to the ranks
    #[arg(long)]
    noenvmodules: bool,

    /// Enable process pinning of the MPI library
    #[arg(long)]
    pinmpi: bool,

    /// Verbose mpdboot
    #[arg(long)]
    mpdbootverbose: bool,

    /// Directory to create the .mympirun job directory in, defaults to $HOME
    #[arg(long)]
    basepath: Option<PathBuf>,

    /// Use this MPI flavor instead of detecting it
    #[arg(long)]
    setmpi: Option<String>,

    /// Use this scheduler instead of detecting it (local, pbs, slurm)
    #[arg(long)]
    setsched: Option<String>,

    /// PMI flavours to try with srun, in order of preference
    #[arg(long, value_enum, value_delimiter = ',')]
    pmi: Vec<Pmi>,

    /// Seconds to wait for `srun --mpi=list`
    #[arg(long)]
    srun_probe_timeout: Option<u64>,

    /// Print the detected MPI flavor and exit
    #[arg(long)]
    showmpi: bool,

    /// Print the detected scheduler and exit
    #[arg(long)]
    showsched: bool,

    /// Print the launch command instead of running it
    #[arg(long)]
    dry_run: bool,

    /// Config file, defaults to $MYMPIRUN_CONFIG or ~/.config/mympirun/config.yaml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Program and arguments to launch
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    cmd: Vec<String>,
}

impl Cli {
    fn into_options(self) -> RunOptions {
        RunOptions {
            hybrid: self.hybrid,
            double: self.double,
            ompthreads: self.ompthreads,
            rdma: self.rdma,
            socket: self.socket,
            variablesprefix: self.variablesprefix,
            mpirunoptions: self
                .mpirunoptions
                .map(|options| options.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            noenvmodules: self.noenvmodules,
            pinmpi: self.pinmpi,
            mpdbootverbose: self.mpdbootverbose,
            basepath: self.basepath,
            setmpi: self.setmpi,
            setsched: self.setsched,
            pmi: self.pmi,
            srun_probe_timeout: self.srun_probe_timeout.map(Duration::from_secs),
            showmpi: self.showmpi,
            showsched: self.showsched,
            dry_run: self.dry_run,
            cmd: self.cmd,
        }
    }
}

fn setup_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("MYMPIRUN_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    // the aliases are symlinks to this binary, argv[0] picks the flavor
    let invoked = env::args_os()
        .next()
        .map(|arg0| arg0.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mympirun".to_string());
    debug!(invoked = %invoked, "Invocation");

    let mut ctx = RunContext::from_process();

    let config = match &cli.config {
        Some(path) => MympirunConfig::open_from_path(path),
        None => MympirunConfig::open(&ctx),
    };
    let config = match config {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "{error}");
            exit(LaunchError::from(error).exit_code());
        }
    };

    let mut options = cli.into_options();
    options.merge_config(config);

    match launch::run(&mut ctx, &options, &invoked) {
        Ok(code) => exit(code),
        Err(error) => {
            error!(error = ?error, "{error}");
            exit(error.exit_code());
        }
    }
}
