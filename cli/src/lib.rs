//! Host glue for the `openclipboard` binary: identity/trust file paths and
//! runtime configuration, generalizing the teacher's bare
//! `default_identity_path`/`default_trust_path` pair into a small `Config`
//! the binary builds from `clap` flags.

use std::path::PathBuf;

pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home);
    }
    PathBuf::from(".")
}

pub fn default_identity_path() -> PathBuf {
    home_dir().join(".openclipboard").join("identity.json")
}

pub fn default_trust_path() -> PathBuf {
    home_dir().join(".openclipboard").join("trust.json")
}

pub fn default_history_path() -> PathBuf {
    home_dir().join(".openclipboard").join("history.json")
}

/// Runtime knobs the teacher only ever exposed as CLI flags; kept in one
/// struct so `main` can build it once per subcommand instead of threading
/// four separate `Option<PathBuf>`/`Option<u64>` parameters around.
#[derive(Debug, Clone)]
pub struct Config {
    pub identity_path: PathBuf,
    pub trust_path: PathBuf,
    pub history_path: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_path: default_identity_path(),
            trust_path: default_trust_path(),
            history_path: default_history_path(),
            poll_interval_ms: 0,
        }
    }
}

pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

pub fn preview(s: &str) -> String {
    const N: usize = 80;
    if s.chars().count() <= N {
        return s.to_string();
    }
    format!("{}…", s.chars().take(N).collect::<String>())
}
