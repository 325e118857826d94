//! Configuration loading from rankmap.toml
//!
//! rankmap configuration can be specified in a `rankmap.toml` file. The
//! configuration is automatically discovered by walking up from the current
//! directory. Command line flags override file values.

use crate::report::OutputFormat;
use rankmap_core::{BindPolicy, available_cpus, team_size_from_env};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name looked for during discovery
pub const CONFIG_FILE: &str = "rankmap.toml";

/// rankmap configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RankmapConfig {
    /// Job shape
    #[serde(default)]
    pub launch: LaunchConfig,
    /// Report output
    #[serde(default)]
    pub output: OutputConfig,
}

/// How ranks are isolated from each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Each rank is a separate process (default)
    #[default]
    Process,
    /// Each rank is a thread of one process
    Thread,
}

impl std::str::FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(IsolationMode::Process),
            "thread" => Ok(IsolationMode::Thread),
            other => Err(format!("Unknown isolation mode: {}", other)),
        }
    }
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IsolationMode::Process => "process",
            IsolationMode::Thread => "thread",
        })
    }
}

/// Team size of every rank.
///
/// Written as a single count (`4`) or per rank (`2,1,3` on the command line,
/// `[2, 1, 3]` in the config file). Ranks past the end of the list reuse its
/// last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ThreadsSetting", into = "ThreadsSetting")]
pub struct TeamSizes(Vec<usize>);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ThreadsSetting {
    Uniform(usize),
    PerRank(Vec<usize>),
}

impl TryFrom<ThreadsSetting> for TeamSizes {
    type Error = String;

    fn try_from(value: ThreadsSetting) -> Result<Self, Self::Error> {
        match value {
            ThreadsSetting::Uniform(n) => TeamSizes::new(vec![n]),
            ThreadsSetting::PerRank(sizes) => TeamSizes::new(sizes),
        }
    }
}

impl From<TeamSizes> for ThreadsSetting {
    fn from(value: TeamSizes) -> Self {
        match value.0.as_slice() {
            [n] => ThreadsSetting::Uniform(*n),
            _ => ThreadsSetting::PerRank(value.0),
        }
    }
}

impl TeamSizes {
    /// Per-rank sizes; every entry must be at least 1.
    pub fn new(sizes: Vec<usize>) -> Result<Self, String> {
        if sizes.is_empty() {
            return Err("Thread count list is empty".to_string());
        }
        if sizes.contains(&0) {
            return Err("Thread counts must be at least 1".to_string());
        }
        Ok(Self(sizes))
    }

    /// The same size for every rank.
    pub fn uniform(threads: usize) -> Self {
        Self(vec![threads.max(1)])
    }

    /// Team size of `rank`.
    pub fn for_rank(&self, rank: usize) -> usize {
        self.0
            .get(rank)
            .or_else(|| self.0.last())
            .copied()
            .unwrap_or(1)
    }

    /// Sizes of ranks `0..processes`.
    pub fn expand(&self, processes: usize) -> Vec<usize> {
        (0..processes).map(|rank| self.for_rank(rank)).collect()
    }
}

impl std::str::FromStr for TeamSizes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sizes = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid thread count: {:?}", part.trim()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        TeamSizes::new(sizes)
    }
}

impl std::fmt::Display for TeamSizes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|n| n.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Job shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchConfig {
    /// Number of ranks
    #[serde(default = "default_processes")]
    pub processes: usize,
    /// Team size per rank (defaults to the environment, then the CPU count)
    #[serde(default)]
    pub threads: Option<TeamSizes>,
    /// Rank isolation: "process" or "thread"
    #[serde(default)]
    pub isolation: IsolationMode,
    /// Thread binding: "none", "compact" or "spread"
    #[serde(default)]
    pub bind: BindPolicy,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            processes: default_processes(),
            threads: None,
            isolation: IsolationMode::default(),
            bind: BindPolicy::default(),
        }
    }
}

fn default_processes() -> usize {
    2
}

/// Report output
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OutputConfig {
    /// Report format: "human" or "json"
    #[serde(default)]
    pub format: OutputFormat,
    /// Report file (stdout if unset)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl RankmapConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let dir = std::env::current_dir().ok()?;
        Self::discover_from(dir)
    }

    /// Discover configuration by walking up from `dir`
    pub fn discover_from(dir: impl Into<PathBuf>) -> Option<Self> {
        let mut dir = dir.into();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return match Self::load(&config_path) {
                    Ok(config) => {
                        tracing::debug!(path = %config_path.display(), "loaded configuration");
                        Some(config)
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %config_path.display(),
                            error = %e,
                            "ignoring unreadable configuration"
                        );
                        None
                    }
                };
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Resolve team sizes: command line, then `RANKMAP_NUM_THREADS` /
    /// `OMP_NUM_THREADS`, then this file, then the CPU count.
    pub fn team_sizes(&self, cli: Option<&TeamSizes>) -> TeamSizes {
        resolve_team_sizes(cli, team_size_from_env(), self.launch.threads.as_ref())
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# rankmap Configuration

[launch]
# Number of ranks
processes = 2
# Threads per rank: one count for every rank, or a list per rank
# (uncomment to enable; defaults to OMP_NUM_THREADS or the CPU count)
# threads = 4
# threads = [2, 1, 3]
# Rank isolation: "process" or "thread"
isolation = "process"
# Thread binding: "none", "compact" or "spread"
bind = "none"

[output]
# Report format: "human" or "json"
format = "human"
# Report file (uncomment to enable; stdout otherwise)
# path = "rankmap.json"
"#
        .to_string()
    }
}

fn resolve_team_sizes(
    cli: Option<&TeamSizes>,
    env: Option<usize>,
    file: Option<&TeamSizes>,
) -> TeamSizes {
    if let Some(sizes) = cli {
        return sizes.clone();
    }
    if let Some(threads) = env {
        return TeamSizes::uniform(threads);
    }
    if let Some(sizes) = file {
        return sizes.clone();
    }
    TeamSizes::uniform(available_cpus())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RankmapConfig::default();
        assert_eq!(config.launch.processes, 2);
        assert_eq!(config.launch.isolation, IsolationMode::Process);
        assert_eq!(config.launch.bind, BindPolicy::None);
        assert_eq!(config.output.format, OutputFormat::Human);
        assert!(config.launch.threads.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [launch]
            processes = 3
            threads = [2, 1, 3]
            isolation = "thread"
            bind = "compact"

            [output]
            format = "json"
        "#;

        let config: RankmapConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.launch.processes, 3);
        assert_eq!(
            config.launch.threads.unwrap().expand(3),
            vec![2, 1, 3]
        );
        assert_eq!(config.launch.isolation, IsolationMode::Thread);
        assert_eq!(config.launch.bind, BindPolicy::Compact);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert!(config.output.path.is_none());
    }

    #[test]
    fn test_uniform_threads_in_toml() {
        let config: RankmapConfig = toml::from_str("[launch]\nthreads = 4\n").unwrap();
        assert_eq!(config.launch.threads, Some(TeamSizes::uniform(4)));
        // Defaults should still apply
        assert_eq!(config.launch.processes, 2);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(toml::from_str::<RankmapConfig>("[launch]\nthreads = 0\n").is_err());
        assert!(toml::from_str::<RankmapConfig>("[launch]\nthreads = [1, 0]\n").is_err());
    }

    #[test]
    fn test_default_toml_parses() {
        let default_toml = RankmapConfig::default_toml();
        let config: RankmapConfig = toml::from_str(&default_toml).unwrap();
        assert_eq!(config, RankmapConfig::default());
    }

    #[test]
    fn test_team_sizes_from_str() {
        let sizes: TeamSizes = "2, 1,3".parse().unwrap();
        assert_eq!(sizes.expand(5), vec![2, 1, 3, 3, 3]);
        assert_eq!(sizes.to_string(), "2,1,3");
        assert_eq!("4".parse::<TeamSizes>().unwrap().expand(2), vec![4, 4]);
        assert!("".parse::<TeamSizes>().is_err());
        assert!("2,x".parse::<TeamSizes>().is_err());
        assert!("0".parse::<TeamSizes>().is_err());
    }

    #[test]
    fn test_team_size_priority() {
        let cli = TeamSizes::uniform(3);
        let file = TeamSizes::uniform(5);
        assert_eq!(resolve_team_sizes(Some(&cli), Some(4), Some(&file)), cli);
        assert_eq!(
            resolve_team_sizes(None, Some(4), Some(&file)),
            TeamSizes::uniform(4)
        );
        assert_eq!(resolve_team_sizes(None, None, Some(&file)), file);
        assert_eq!(
            resolve_team_sizes(None, None, None),
            TeamSizes::uniform(available_cpus())
        );
    }

    #[test]
    fn test_discover_walks_up() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE),
            "[launch]\nprocesses = 5\n",
        )
        .unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config = RankmapConfig::discover_from(&nested).unwrap();
        assert_eq!(config.launch.processes, 5);
    }

    #[test]
    fn test_discover_ignores_invalid_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(CONFIG_FILE), "[launch\n").unwrap();
        assert!(RankmapConfig::discover_from(root.path()).is_none());
    }
}
