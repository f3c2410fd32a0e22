use super::{Daemon, Flavor, OptionStyle, ParamOption};
use crate::{network::Device, pmi::Pmi};

pub const OPENMPI: Flavor = Flavor {
    name: "OpenMPI",
    aliases: &["ompirun"],
    mpirun_for: &["OpenMPI"],
    version_filter: None,
    launcher: "mpirun",
    env_prefixes: &["OMPI"],
    // byte transfer layers, in order of preference
    device_map: &[
        (Device::Ib, "sm,openib,self"),
        (Device::Det, "sm,tcp,self"),
        (Device::Shm, "sm,self"),
        (Device::Socket, "sm,tcp,self"),
    ],
    device_option: ParamOption::Mca("btl"),
    netmask_option: ParamOption::None,
    node_file_option: "--hostfile",
    option_style: OptionStyle::OpenMpi,
    daemon: Daemon::Orte,
    pinning: None,
    pmi: &[Pmi::Pmix, Pmi::Pmi2],
};
