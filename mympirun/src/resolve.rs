use crate::context::RunContext;
use std::{
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace};

/// Subdirectory of the install prefix holding the `mpirun` shims that route back into mympirun
pub const FAKE_SUBDIRECTORY_NAME: &str = "fake";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Unable to find an executable for {0} in $PATH")]
    NotFound(String),
    #[error("Resolved launcher {0:?} is mympirun itself")]
    SelfReference(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
}

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ResolveError> {
    if !path.is_file() {
        Ok(false)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ResolveError::MetadataNotFound(e)),
        }
    }
}

/// true if any component of `entry` is the fake shim directory
pub fn is_fake(entry: &Path) -> bool {
    entry
        .components()
        .any(|component| matches!(component, Component::Normal(name) if name == FAKE_SUBDIRECTORY_NAME))
}

/// Locate `name` on the search path of `ctx`, never looking into fake directories.
pub fn which(ctx: &RunContext, name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return match check_executable(&path) {
            Ok(true) if !is_fake(&path) => Some(path),
            _ => None,
        };
    }

    for entry in ctx.search_path() {
        if is_fake(&entry) {
            trace!(entry = ?entry, "Skipping fake path entry");
            continue;
        }

        let candidate = entry.join(name);
        match check_executable(&candidate) {
            Ok(true) => {
                debug!(name = name, path = ?candidate, "Resolved executable");
                return Some(candidate);
            }
            Ok(false) => {}
            Err(error) => debug!(error = ?error, path = ?candidate, "Failed to inspect candidate"),
        }
    }

    None
}

/// Drop every fake entry from the `PATH` of `ctx`.
pub fn stripfake(ctx: &mut RunContext) {
    let (fake, kept): (Vec<_>, Vec<_>) = ctx.search_path().into_iter().partition(|entry| is_fake(entry));

    if !fake.is_empty() {
        debug!(removed = ?fake, "Stripped fake directories from PATH");
        ctx.set_search_path(kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{search_path, write_executable};
    use std::{fs, path::PathBuf};

    #[test]
    fn which_skips_fake_and_non_executables() {
        let root = tempfile::tempdir().unwrap();
        let fake = root.path().join("opt").join(FAKE_SUBDIRECTORY_NAME).join("bin");
        let plain = root.path().join("plain");
        let bin = root.path().join("bin");

        write_executable(&fake, "tool", "exit 0");
        fs::create_dir_all(&plain).unwrap();
        fs::write(plain.join("tool"), "not executable").unwrap();
        let tool = write_executable(&bin, "tool", "exit 0");

        let ctx = RunContext::from_vars([("PATH", search_path(&[&fake, &plain, &bin]))]);
        assert_eq!(which(&ctx, "tool"), Some(tool.clone()));
        assert_eq!(which(&ctx, "missing"), None);
        assert_eq!(which(&ctx, &tool.to_string_lossy()), Some(tool));
    }

    #[test]
    fn stripfake_is_idempotent() {
        let mut ctx = RunContext::from_vars([("PATH", "/apps/fake/bin:/usr/bin:/apps/mympirun/fake")]);

        stripfake(&mut ctx);
        let once = ctx.search_path();
        stripfake(&mut ctx);

        assert_eq!(once, vec![PathBuf::from("/usr/bin")]);
        assert_eq!(ctx.search_path(), once);
        // only whole components count
        assert!(!is_fake(Path::new("/opt/fakeroot/bin")));
    }
}
