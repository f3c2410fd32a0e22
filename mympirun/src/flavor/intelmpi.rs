use super::{Daemon, Flavor, OptionStyle, ParamOption, VersionFilter};
use crate::{network::Device, pmi::Pmi};

const INTEL_DEVICES: &[(Device, &str)] = &[
    (Device::Ib, "rdssm"),
    (Device::Det, "det"),
    (Device::Shm, "shm"),
    (Device::Socket, "sock"),
];

/// Intel MPI before 4.0, launched through an mpd ring
pub const INTELMPI: Flavor = Flavor {
    name: "IntelMPI",
    aliases: &["impirun"],
    mpirun_for: &["impi"],
    version_filter: Some(VersionFilter::Below(4)),
    launcher: "mpirun",
    env_prefixes: &["I_MPI"],
    device_map: INTEL_DEVICES,
    device_option: ParamOption::GlobalEnv("I_MPI_DEVICE"),
    netmask_option: ParamOption::GlobalEnv("I_MPI_NETMASK"),
    node_file_option: "-machinefile",
    option_style: OptionStyle::Mpd,
    daemon: Daemon::Mpd,
    pinning: Some("I_MPI_PIN"),
    pmi: &[Pmi::Pmi2],
};

pub const INTEL_HYDRA_MPI: Flavor = Flavor {
    name: "IntelHydraMPI",
    aliases: &["ihmpirun"],
    mpirun_for: &["impi"],
    version_filter: Some(VersionFilter::AtLeast(4)),
    launcher: "mpirun",
    env_prefixes: &["I_MPI"],
    device_map: INTEL_DEVICES,
    device_option: ParamOption::GlobalEnv("I_MPI_DEVICE"),
    netmask_option: ParamOption::GlobalEnv("I_MPI_NETMASK"),
    node_file_option: "-machinefile",
    option_style: OptionStyle::Hydra,
    daemon: Daemon::Hydra,
    pinning: Some("I_MPI_PIN"),
    pmi: &[Pmi::Pmi2, Pmi::Pmix],
};
