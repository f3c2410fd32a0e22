use std::{
    fs::{self, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Write an executable shell script `dir/name`, creating `dir` as needed.
pub fn write_executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
    path
}

/// `PATH` value made of `entries`, in order
pub fn search_path<P: AsRef<Path>>(entries: &[P]) -> String {
    std::env::join_paths(entries.iter().map(|entry| -> &Path { entry.as_ref() }))
        .unwrap()
        .to_string_lossy()
        .into_owned()
}
