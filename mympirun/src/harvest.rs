use crate::{config::RunOptions, context::RunContext, flavor::Flavor};
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::debug;

pub const MODULE_ENVIRONMENT_VARIABLES: [&str; 3] = ["MODULEPATH", "LOADEDMODULES", "MODULESHOME"];

/// Prefixes forwarded to the ranks for every flavor
pub const OPTS_FROM_ENV_BASE_PREFIX: [&str; 16] = [
    "OMP",
    "MKL",
    "KMP",
    "DAPL",
    "PSM",
    "IPATH",
    "TMI",
    "PSC",
    "O64",
    "VSMP",
    "LD_LIBRARY_PATH",
    "PATH",
    "PYTHONPATH",
    "CLASSPATH",
    "LD_PRELOAD",
    "PYTHONUNBUFFERED",
];

/// Decide `OMP_NUM_THREADS` and store it in the run environment.
pub fn set_omp_threads(
    ctx: &mut RunContext,
    requested: Option<usize>,
    cores_per_node: usize,
    processes_per_node: usize,
) -> String {
    let threads = match requested {
        Some(threads) => threads.to_string(),
        None => match ctx.var("OMP_NUM_THREADS") {
            Some(threads) => threads.to_string(),
            None => (cores_per_node / processes_per_node.max(1)).max(1).to_string(),
        },
    };

    debug!(threads = %threads, "OMP_NUM_THREADS");
    ctx.set_var("OMP_NUM_THREADS", threads.clone());
    threads
}

/// Global options every rank gets, independent of what is exported in the environment
pub fn set_mpiexec_global_options(
    ctx: &RunContext,
    flavor: &Flavor,
    options: &RunOptions,
) -> BTreeMap<String, String> {
    let mut global = BTreeMap::new();
    global.insert("MKL_NUM_THREADS".to_string(), "1".to_string());

    if options.pinmpi {
        if let Some(pinning) = flavor.pinning {
            global.insert(pinning.to_string(), "1".to_string());
        }
    }

    if !options.noenvmodules {
        for name in MODULE_ENVIRONMENT_VARIABLES {
            if let Some(value) = ctx.var(name) {
                global.insert(name.to_string(), value.to_string());
            }
        }
    }

    debug!(options = ?global, "Global mpiexec options");
    global
}

/// Sorted names of the variables to forward to all ranks
pub fn set_mpiexec_opts_from_env(ctx: &RunContext, flavor: &Flavor, extra: &[String]) -> Vec<String> {
    let prefixes = OPTS_FROM_ENV_BASE_PREFIX
        .iter()
        .chain(flavor.env_prefixes.iter())
        .copied()
        .chain(extra.iter().map(String::as_str))
        .filter(|prefix| !prefix.is_empty())
        .collect_vec();

    // the env table is a BTreeMap, so names come out sorted
    let names = ctx
        .vars()
        .keys()
        .filter(|name| prefixes.iter().any(|prefix| name.starts_with(prefix)))
        .cloned()
        .collect_vec();

    debug!(names = ?names, "Forwarded environment");
    names
}
