use std::{
    collections::BTreeMap,
    env, fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    process::{exit, Command},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

pub const DEFAULT_MPS_CONTROL: &str = "/usr/bin/nvidia-cuda-mps-control";

#[derive(Error, Debug)]
pub enum PrologError {
    #[error("Environment variable {0} is not set")]
    MissingVariable(&'static str),
    #[error("Failed to create MPS directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write exports")]
    Output(#[from] io::Error),
}

fn require<'a>(env: &'a BTreeMap<String, String>, name: &'static str) -> Result<&'a str, PrologError> {
    env.get(name)
        .map(String::as_str)
        .ok_or(PrologError::MissingVariable(name))
}

/// `export` lines on stdout are picked up by the srun task prolog
fn export(out: &mut impl Write, key: &str, value: &Path) -> Result<(), PrologError> {
    writeln!(out, "export {key}={}", value.display())?;
    Ok(())
}

/// Start the MPS control daemon for the GPUs of this task when MPS was requested.
///
/// Returns the MPS directory, or `None` if `CUDA_MPS_ACTIVE_THREAD_PERCENTAGE` is unset.
pub fn setup_mps(
    env: &BTreeMap<String, String>,
    out: &mut impl Write,
) -> Result<Option<PathBuf>, PrologError> {
    if !env.contains_key("CUDA_MPS_ACTIVE_THREAD_PERCENTAGE") {
        debug!("MPS not requested");
        return Ok(None);
    }

    // TMPDIR is per job, one directory per set of visible devices
    let mpsdir = Path::new(require(env, "TMPDIR")?)
        .join("mps")
        .join(require(env, "CUDA_VISIBLE_DEVICES")?);

    match fs::create_dir_all(&mpsdir) {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
        Err(source) => {
            return Err(PrologError::CreateDir {
                path: mpsdir,
                source,
            })
        }
    }

    export(out, "CUDA_MPS_PIPE_DIRECTORY", &mpsdir)?;
    export(out, "CUDA_MPS_LOG_DIRECTORY", &mpsdir)?;
    out.flush()?;

    let control = PathBuf::from(
        env.get("MYTASKPROLOG_MPS_CONTROL")
            .map(String::as_str)
            .unwrap_or(DEFAULT_MPS_CONTROL),
    );

    // concurrent tasks race here, the daemon sorts that out
    let status = Command::new(&control)
        .arg("-d")
        .env_clear()
        .envs(env)
        .env("CUDA_MPS_PIPE_DIRECTORY", &mpsdir)
        .env("CUDA_MPS_LOG_DIRECTORY", &mpsdir)
        .status();

    // the exports are already out, the task runs without MPS
    match status {
        Ok(status) if status.success() => {
            info!(control = ?control, mpsdir = ?mpsdir, "Started MPS control daemon")
        }
        Ok(status) => {
            warn!(control = ?control, status = ?status, "MPS control daemon exited unsuccessfully")
        }
        Err(error) => warn!(control = ?control, error = ?error, "Failed to start MPS control daemon"),
    }

    Ok(Some(mpsdir))
}

fn main() {
    // stdout belongs to the task prolog protocol
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("MYTASKPROLOG_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let env: BTreeMap<String, String> = env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect();

    if let Err(error) = setup_mps(&env, &mut io::stdout().lock()) {
        error!(error = ?error, "{error}");
        exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn environment(values: &[(&str, &str)]) -> BTreeMap<String, String> {
        values
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn mps_not_requested() {
        let mut out = Vec::new();
        let env = environment(&[("TMPDIR", "/nonexistent"), ("CUDA_VISIBLE_DEVICES", "0")]);

        assert_eq!(setup_mps(&env, &mut out).unwrap(), None);
        assert!(out.is_empty());
    }

    #[test]
    fn mps_exports_and_starts_control() {
        let tmp = tempfile::tempdir().unwrap();
        let control = tmp.path().join("showargs");
        let marker = tmp.path().join("control-args");
        fs::write(
            &control,
            format!("#!/bin/sh\necho \"$@\" > {}\n", marker.display()),
        )
        .unwrap();
        fs::set_permissions(&control, fs::Permissions::from_mode(0o755)).unwrap();

        let tmpdir = tmp.path().to_string_lossy().into_owned();
        let control_path = control.to_string_lossy().into_owned();
        let env = environment(&[
            ("CUDA_MPS_ACTIVE_THREAD_PERCENTAGE", "10"),
            ("TMPDIR", &tmpdir),
            ("CUDA_VISIBLE_DEVICES", "2,3"),
            ("MYTASKPROLOG_MPS_CONTROL", &control_path),
        ]);

        let mut out = Vec::new();
        let mpsdir = setup_mps(&env, &mut out).unwrap().unwrap();

        assert_eq!(mpsdir, tmp.path().join("mps").join("2,3"));
        assert!(mpsdir.is_dir());
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!(
                "export CUDA_MPS_PIPE_DIRECTORY={0}/mps/2,3\nexport CUDA_MPS_LOG_DIRECTORY={0}/mps/2,3\n",
                tmpdir
            )
        );
        assert_eq!(fs::read_to_string(marker).unwrap().trim(), "-d");

        // directory already exists on the second task of the job
        let mut out = Vec::new();
        assert!(setup_mps(&env, &mut out).unwrap().is_some());
    }

    #[test]
    fn missing_control_binary_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let tmpdir = tmp.path().to_string_lossy().into_owned();
        let control = tmp.path().join("no-such-control").to_string_lossy().into_owned();
        let env = environment(&[
            ("CUDA_MPS_ACTIVE_THREAD_PERCENTAGE", "50"),
            ("TMPDIR", &tmpdir),
            ("CUDA_VISIBLE_DEVICES", "0"),
            ("MYTASKPROLOG_MPS_CONTROL", &control),
        ]);

        let mut out = Vec::new();
        let mpsdir = setup_mps(&env, &mut out).unwrap();

        assert_eq!(mpsdir, Some(tmp.path().join("mps").join("0")));
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
    }

    #[test]
    fn missing_tmpdir() {
        let env = environment(&[
            ("CUDA_MPS_ACTIVE_THREAD_PERCENTAGE", "10"),
            ("CUDA_VISIBLE_DEVICES", "0"),
        ]);

        assert!(matches!(
            setup_mps(&env, &mut Vec::new()),
            Err(PrologError::MissingVariable("TMPDIR"))
        ));
    }
}
