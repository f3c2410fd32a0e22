use super::{Daemon, Flavor, OptionStyle, ParamOption};
use crate::{network::Device, pmi::Pmi};

pub const MPICH2_HYDRA: Flavor = Flavor {
    name: "MPICH2Hydra",
    aliases: &["m2hmpirun"],
    mpirun_for: &["MPICH2", "MPICH"],
    version_filter: None,
    launcher: "mpirun",
    env_prefixes: &["MPICH"],
    device_map: &[
        (Device::Ib, "ib"),
        (Device::Det, "tcp"),
        (Device::Shm, "tcp"),
        (Device::Socket, "tcp"),
    ],
    device_option: ParamOption::GlobalEnv("MPICH_NEMESIS_NETMOD"),
    netmask_option: ParamOption::None,
    node_file_option: "-machinefile",
    option_style: OptionStyle::Hydra,
    daemon: Daemon::Hydra,
    pinning: None,
    pmi: &[Pmi::Pmi2, Pmi::Pmix],
};

pub const MVAPICH2_HYDRA: Flavor = Flavor {
    name: "MVAPICH2Hydra",
    aliases: &["mhmpirun"],
    mpirun_for: &["MVAPICH2"],
    version_filter: None,
    launcher: "mpirun",
    env_prefixes: &["MV2"],
    // MVAPICH2 picks its channel at build time
    device_map: &[
        (Device::Ib, "ib"),
        (Device::Det, "ib"),
        (Device::Shm, "shm"),
        (Device::Socket, "tcp"),
    ],
    device_option: ParamOption::None,
    netmask_option: ParamOption::None,
    node_file_option: "-machinefile",
    option_style: OptionStyle::Hydra,
    daemon: Daemon::Hydra,
    pinning: Some("MV2_ENABLE_AFFINITY"),
    pmi: &[Pmi::Pmi2, Pmi::Pmix],
};
