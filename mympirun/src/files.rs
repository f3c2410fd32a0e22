use itertools::Itertools;
use rand::{distributions::Alphanumeric, Rng};
use std::{
    fs::{self, OpenOptions, Permissions},
    io::{Error, ErrorKind, Write},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

pub const MYMPIRUN_DIR: &str = ".mympirun";
pub const NODE_FILE: &str = "nodes";
pub const MPDBOOT_FILE: &str = "mpdboot";
pub const MPD_CONF_FILE: &str = "mpd.conf";
pub const MPD_CONF_MODE: u32 = 0o400;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("No base path for the job directory, set --basepath or $HOME")]
    MissingBasePath,
    #[error("Failed to create directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Failed to set permissions of {path:?}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("{path:?} has mode {mode:o}, expected {expected:o}")]
    WrongMode { path: PathBuf, mode: u32, expected: u32 },
}

/// Create `path` and its parents, returns `false` if it already existed.
pub fn create_if_absent(path: &Path) -> Result<bool, FileError> {
    match fs::create_dir(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(false),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|source| FileError::CreateDir {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(true)
        }
        Err(source) => Err(FileError::CreateDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Per job directory `<basepath>/.mympirun/<sched_id>_<epoch seconds>`
#[instrument(level = "debug")]
pub fn make_mympirundir(basepath: Option<&Path>, sched_id: &str) -> Result<PathBuf, FileError> {
    let basepath = basepath.ok_or(FileError::MissingBasePath)?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    let dir = basepath
        .join(MYMPIRUN_DIR)
        .join(format!("{sched_id}_{timestamp}"));

    if create_if_absent(&dir)? {
        info!(dir = ?dir, "Created job directory");
    } else {
        debug!(dir = ?dir, "Reusing existing job directory");
    }

    Ok(dir)
}

fn write_lines<'a>(path: &Path, lines: impl Iterator<Item = &'a String>) -> Result<(), FileError> {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }

    fs::write(path, content).map_err(|source| FileError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// One host per process slot, replacing any earlier node file
pub fn make_node_file(dir: &Path, nodes: &[String]) -> Result<PathBuf, FileError> {
    let path = dir.join(NODE_FILE);
    write_lines(&path, nodes.iter())?;
    debug!(path = ?path, slots = nodes.len(), "Wrote node file");

    Ok(path)
}

/// Hosts file for mpdboot, every node once
pub fn make_mpdboot_file(dir: &Path, nodes: &[String]) -> Result<PathBuf, FileError> {
    let path = dir.join(MPDBOOT_FILE);
    write_lines(&path, nodes.iter().unique())?;
    debug!(path = ?path, "Wrote mpdboot hosts file");

    Ok(path)
}

pub fn random_secret() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat(())
        .map(|()| rng.sample(Alphanumeric))
        .map(char::from)
        .take(32)
        .collect()
}

/// Write `mpd.conf` with a fresh secret, readable by the owner only.
#[instrument(level = "debug")]
pub fn make_mpdboot(dir: &Path) -> Result<PathBuf, FileError> {
    let path = dir.join(MPD_CONF_FILE);
    let write_error = |source| FileError::Write {
        path: path.clone(),
        source,
    };

    // an earlier 0400 file can't be opened for writing
    match fs::remove_file(&path) {
        Ok(()) => debug!(path = ?path, "Removed previous mpd.conf"),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(source) => return Err(write_error(source)),
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(MPD_CONF_MODE)
        .open(&path)
        .map_err(write_error)?;
    writeln!(file, "MPD_SECRETWORD={}", random_secret()).map_err(write_error)?;

    fs::set_permissions(&path, Permissions::from_mode(MPD_CONF_MODE)).map_err(|source| {
        FileError::Permissions {
            path: path.clone(),
            source,
        }
    })?;

    let mode = fs::metadata(&path)
        .map_err(|source| FileError::Permissions {
            path: path.clone(),
            source,
        })?
        .permissions()
        .mode()
        & 0o777;

    if mode != MPD_CONF_MODE {
        error!(path = ?path, mode = mode, "mpd.conf has the wrong permissions");
        return Err(FileError::WrongMode {
            path,
            mode,
            expected: MPD_CONF_MODE,
        });
    }

    Ok(path)
}
