use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};
use tracing::warn;

/// Environment table and search path of a single run.
///
/// Stages never touch the process environment directly: `stripfake` rewrites the `PATH`
/// stored here, the PMI adapter removes scheduler variables from it and the launcher is
/// started with exactly this table.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    env: BTreeMap<String, String>,
    // canonical path of the running wrapper, a launcher resolving to it is rejected
    self_exe: Option<PathBuf>,
}

impl RunContext {
    /// snapshot the environment of the current process
    pub fn from_process() -> Self {
        let env = env::vars_os()
            .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some((key, value)),
                (key, _) => {
                    warn!(key = ?key, "Skipping environment variable that is not valid unicode");
                    None
                }
            })
            .collect();

        Self {
            env,
            self_exe: env::current_exe().and_then(|exe| exe.canonicalize()).ok(),
        }
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            env: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            self_exe: None,
        }
    }

    pub fn with_self_exe(mut self, path: impl Into<PathBuf>) -> Self {
        self.self_exe = Some(path.into());
        self
    }

    pub fn self_exe(&self) -> Option<&Path> {
        self.self_exe.as_deref()
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.env.contains_key(key)
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn remove_var(&mut self, key: &str) -> Option<String> {
        self.env.remove(key)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// ordered `PATH` entries
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.var("PATH")
            .map(|path| env::split_paths(path).collect())
            .unwrap_or_default()
    }

    pub fn set_search_path(&mut self, entries: Vec<PathBuf>) {
        match env::join_paths(entries) {
            Ok(joined) => self.set_var("PATH", joined.to_string_lossy()),
            // entries come from split_paths, so this only happens for hand-made entries
            Err(error) => warn!(error = ?error, "Refusing to store unjoinable PATH"),
        }
    }

    pub fn home(&self) -> Option<PathBuf> {
        self.var("HOME").map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_path_round_trip() {
        let mut ctx = RunContext::from_vars([("PATH", "/usr/bin:/opt/bin/fake:/bin")]);
        assert_eq!(
            ctx.search_path(),
            vec![
                PathBuf::from("/usr/bin"),
                PathBuf::from("/opt/bin/fake"),
                PathBuf::from("/bin")
            ]
        );

        ctx.set_search_path(vec![PathBuf::from("/bin")]);
        assert_eq!(ctx.var("PATH"), Some("/bin"));
    }

    #[test]
    fn missing_path_is_empty() {
        let ctx = RunContext::from_vars(Vec::<(String, String)>::new());
        assert!(ctx.search_path().is_empty());
        assert!(ctx.home().is_none());
    }
}
