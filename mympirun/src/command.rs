use crate::{
    context::RunContext,
    flavor::{Flavor, OptionStyle, ParamOption},
};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    io::Error,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Refusing to run an empty command")]
    Empty,
    #[error("Failed to start {cmd}")]
    Spawn {
        cmd: String,
        #[source]
        source: Error,
    },
}

/// Final launcher invocation, assembled in the order the launcher expects its options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub launcher: PathBuf,
    pub mpirunoptions: Vec<String>,
    pub mpdboot_options: Vec<String>,
    pub mpiexec_options: Vec<String>,
    /// user command and arguments, passed through verbatim
    pub cmdargs: Vec<String>,
}

impl LaunchCommand {
    pub fn build_command(&self) -> Vec<String> {
        std::iter::once(self.launcher.to_string_lossy().into_owned())
            .chain(self.mpirunoptions.iter().cloned())
            .chain(self.mpdboot_options.iter().cloned())
            .chain(self.mpiexec_options.iter().cloned())
            .chain(self.cmdargs.iter().cloned())
            .collect()
    }

    /// command line as it could be pasted into a shell
    pub fn render(&self) -> String {
        self.build_command().iter().map(|arg| shell_quote(arg)).join(" ")
    }
}

pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));

    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Options for booting the mpd ring before the launch
pub fn make_mpdboot_options(
    nr_unique_nodes: usize,
    mpdboot_file: &Path,
    localhost: &str,
    verbose: bool,
) -> Vec<String> {
    let mut options = vec![
        format!("--totalnum={nr_unique_nodes}"),
        format!("--file={}", mpdboot_file.display()),
        format!("--ifhn={localhost}"),
        "-r".to_string(),
        "ssh".to_string(),
    ];

    if verbose {
        options.push("--verbose".to_string());
    }

    options
}

/// Inputs of the launch-time options, gathered by the earlier stages
#[derive(Debug)]
pub struct MpiexecInputs<'a> {
    pub node_file: &'a Path,
    pub slots: usize,
    /// flavor spelling of the selected device
    pub device: Option<&'a str>,
    pub netmask: Option<&'a str>,
    pub global_options: &'a BTreeMap<String, String>,
    pub opts_from_env: &'a [String],
    pub ctx: &'a RunContext,
}

fn apply_param(
    option: ParamOption,
    value: Option<&str>,
    options: &mut Vec<String>,
    global: &mut BTreeMap<String, String>,
) {
    match (option, value) {
        (ParamOption::Mca(param), Some(value)) => {
            options.extend(["--mca".to_string(), param.to_string(), value.to_string()])
        }
        (ParamOption::GlobalEnv(name), Some(value)) => {
            global.insert(name.to_string(), value.to_string());
        }
        (ParamOption::None, _) | (_, None) => {}
    }
}

fn render_global(style: OptionStyle, name: &str, value: &str) -> Vec<String> {
    match style {
        OptionStyle::OpenMpi => vec!["-x".to_string(), format!("{name}={value}")],
        OptionStyle::Hydra | OptionStyle::Mpd => {
            vec!["-genv".to_string(), name.to_string(), value.to_string()]
        }
    }
}

fn render_forwarded(style: OptionStyle, names: &[String], ctx: &RunContext) -> Vec<String> {
    if names.is_empty() {
        return Vec::new();
    }

    match style {
        OptionStyle::OpenMpi => names
            .iter()
            .flat_map(|name| ["-x".to_string(), name.clone()])
            .collect(),
        OptionStyle::Hydra => vec!["-envlist".to_string(), names.join(",")],
        OptionStyle::Mpd => names
            .iter()
            .filter_map(|name| ctx.var(name).map(|value| render_global(style, name, value)))
            .flatten()
            .collect(),
    }
}

/// Launch-time options: node file, process count, device, netmask and environment.
#[instrument(skip_all, fields(flavor = flavor.name), level = "debug")]
pub fn make_mpiexec_options(flavor: &Flavor, inputs: MpiexecInputs) -> Vec<String> {
    let mut options = vec![
        flavor.node_file_option.to_string(),
        inputs.node_file.to_string_lossy().into_owned(),
        "-np".to_string(),
        inputs.slots.to_string(),
    ];

    let mut global = inputs.global_options.clone();
    apply_param(flavor.device_option, inputs.device, &mut options, &mut global);
    apply_param(flavor.netmask_option, inputs.netmask, &mut options, &mut global);

    options.extend(
        global
            .iter()
            .flat_map(|(name, value)| render_global(flavor.option_style, name, value)),
    );

    // names already passed as global options keep their global value
    let forwarded = inputs
        .opts_from_env
        .iter()
        .filter(|name| !global.contains_key(name.as_str()))
        .cloned()
        .collect_vec();
    options.extend(render_forwarded(flavor.option_style, &forwarded, inputs.ctx));

    debug!(options = ?options, "mpiexec options");
    options
}

/// Run `cmd` with exactly the environment of `ctx` and return its exit code.
#[instrument(skip(ctx), level = "info")]
pub fn execute(cmd: &[String], ctx: &RunContext) -> Result<i32, CommandError> {
    let (program, args) = cmd.split_first().ok_or(CommandError::Empty)?;

    info!("Running {}", cmd.iter().map(|arg| shell_quote(arg)).join(" "));

    let status = Command::new(program)
        .args(args)
        .env_clear()
        .envs(ctx.vars())
        .status()
        .map_err(|source| CommandError::Spawn {
            cmd: program.clone(),
            source,
        })?;

    match (status.code(), status.signal()) {
        (Some(code), _) => {
            debug!(code = code, "Launcher exited");
            Ok(code)
        }
        (None, Some(signal)) => {
            warn!(signal = signal, "Launcher was killed by a signal");
            Ok(128 + signal)
        }
        (None, None) => {
            warn!(status = ?status, "Launcher exited without a status");
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::{Flavor, UNTYPED};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn command_keeps_user_arguments_last() {
        let cmd = LaunchCommand {
            launcher: PathBuf::from("/opt/mpi/bin/mpirun"),
            mpirunoptions: strings(&["-v"]),
            mpdboot_options: Vec::new(),
            mpiexec_options: strings(&["-np", "2"]),
            cmdargs: strings(&["echo", "foo"]),
        };

        assert_eq!(
            cmd.build_command(),
            strings(&["/opt/mpi/bin/mpirun", "-v", "-np", "2", "echo", "foo"])
        );
        assert_eq!(cmd.render(), "/opt/mpi/bin/mpirun -v -np 2 echo foo");
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain/path-1.0"), "plain/path-1.0");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn openmpi_options() {
        let flavor = Flavor::by_name("ompirun").unwrap();
        let ctx = RunContext::from_vars([("OMP_NUM_THREADS", "2")]);
        let global = BTreeMap::from([("MKL_NUM_THREADS".to_string(), "1".to_string())]);
        let forwarded = strings(&["OMP_NUM_THREADS"]);

        let options = make_mpiexec_options(
            flavor,
            MpiexecInputs {
                node_file: Path::new("/job/nodes"),
                slots: 4,
                device: Some("sm,openib,self"),
                netmask: None,
                global_options: &global,
                opts_from_env: &forwarded,
                ctx: &ctx,
            },
        );

        assert_eq!(
            options,
            strings(&[
                "--hostfile",
                "/job/nodes",
                "-np",
                "4",
                "--mca",
                "btl",
                "sm,openib,self",
                "-x",
                "MKL_NUM_THREADS=1",
                "-x",
                "OMP_NUM_THREADS",
            ])
        );
    }

    #[test]
    fn intel_options_use_global_env() {
        let flavor = Flavor::by_name("impirun").unwrap();
        let ctx = RunContext::from_vars([("OMP_NUM_THREADS", "2")]);
        let global = BTreeMap::new();
        let forwarded = strings(&["OMP_NUM_THREADS"]);

        let options = make_mpiexec_options(
            flavor,
            MpiexecInputs {
                node_file: Path::new("/job/nodes"),
                slots: 2,
                device: Some("rdssm"),
                netmask: Some("10.0.0.0/255.0.0.0"),
                global_options: &global,
                opts_from_env: &forwarded,
                ctx: &ctx,
            },
        );

        assert_eq!(
            options,
            strings(&[
                "-machinefile",
                "/job/nodes",
                "-np",
                "2",
                "-genv",
                "I_MPI_DEVICE",
                "rdssm",
                "-genv",
                "I_MPI_NETMASK",
                "10.0.0.0/255.0.0.0",
                "-genv",
                "OMP_NUM_THREADS",
                "2",
            ])
        );
    }

    #[test]
    fn mpdboot_options() {
        assert_eq!(
            make_mpdboot_options(3, Path::new("/job/mpdboot"), "node1", true),
            strings(&[
                "--totalnum=3",
                "--file=/job/mpdboot",
                "--ifhn=node1",
                "-r",
                "ssh",
                "--verbose"
            ])
        );
    }

    #[test]
    fn untyped_has_no_device_option() {
        let ctx = RunContext::default();
        let options = make_mpiexec_options(
            &UNTYPED,
            MpiexecInputs {
                node_file: Path::new("nodes"),
                slots: 1,
                device: Some("socket"),
                netmask: None,
                global_options: &BTreeMap::new(),
                opts_from_env: &[],
                ctx: &ctx,
            },
        );
        assert_eq!(options, strings(&["-machinefile", "nodes", "-np", "1"]));
    }

    #[test]
    fn exit_codes() {
        let ctx = RunContext::default();
        assert_eq!(
            execute(&strings(&["/bin/sh", "-c", "exit 3"]), &ctx).unwrap(),
            3
        );
        assert_eq!(
            execute(&strings(&["/bin/sh", "-c", "kill -TERM $$"]), &ctx).unwrap(),
            128 + 15
        );
        assert!(matches!(execute(&[], &ctx), Err(CommandError::Empty)));
        assert!(matches!(
            execute(&strings(&["/nonexistent/launcher"]), &ctx),
            Err(CommandError::Spawn { .. })
        ));
    }
}
