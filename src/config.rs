// Coordinator configuration (spec §6): a TOML file merged with CLI flags,
// following the teacher's clap-derive + serde(deny_unknown_fields) idiom
// from its own config loading (previously for limmat's run-config; the
// shape here is entirely new, but the mechanism -- parse a struct with
// serde defaults, let clap override individual fields -- is the same).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

fn default_consul_address() -> String {
    "localhost:8500".to_owned()
}

fn default_monitor_period_secs() -> u64 {
    3
}

fn default_watch_period_secs() -> u64 {
    1
}

fn default_descriptor_prefix() -> String {
    "config/global".to_owned()
}

fn default_output_prefix() -> String {
    "config/app".to_owned()
}

fn default_leader_key() -> String {
    "service/confmaster/leader".to_owned()
}

fn default_session_ttl_secs() -> u64 {
    15
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("/var/lib/confd-coordinator/repos")
}

fn default_git_http_addr() -> String {
    "0.0.0.0:9418".to_owned()
}

fn default_git_http_advertise_addr() -> String {
    "localhost:9418".to_owned()
}

/// The on-disk / TOML-file shape of the coordinator's configuration (spec
/// §6). Every field has a default so an empty file is a valid, if inert,
/// configuration; `#[serde(deny_unknown_fields)]` catches typos in the file
/// the same way the teacher's own config parsing does.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default = "default_consul_address")]
    pub consul_address: String,

    #[serde(default = "default_monitor_period_secs")]
    pub monitor_period_secs: u64,

    #[serde(default = "default_watch_period_secs")]
    pub watch_period_secs: u64,

    #[serde(default = "default_descriptor_prefix")]
    pub descriptor_prefix: String,

    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    #[serde(default = "default_leader_key")]
    pub leader_key: String,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,

    #[serde(default = "default_git_http_addr")]
    pub git_http_addr: String,

    /// `host:port` other nodes use to reach this node's git-http endpoint
    /// (spec §6: "publishes its URL to the `_meta/repo` field so downstream
    /// slaves can clone from their upstream master"). Kept distinct from
    /// `git_http_addr` because the bind address is often a wildcard
    /// (`0.0.0.0`) that isn't itself a routable client-facing host.
    #[serde(default = "default_git_http_advertise_addr")]
    pub git_http_advertise_addr: String,

    /// Spec §4.3: "Non-candidates never attempt acquisition." A node that
    /// never wants to become leader (e.g. one that only wants to observe who
    /// is) still runs the full pipeline, but its Fetcher stays gated off
    /// since `is_self_leader` can never become true.
    #[serde(default = "default_master_candidate")]
    pub master_candidate: bool,
}

fn default_master_candidate() -> bool {
    true
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            consul_address: default_consul_address(),
            monitor_period_secs: default_monitor_period_secs(),
            watch_period_secs: default_watch_period_secs(),
            descriptor_prefix: default_descriptor_prefix(),
            output_prefix: default_output_prefix(),
            leader_key: default_leader_key(),
            session_ttl_secs: default_session_ttl_secs(),
            repos_dir: default_repos_dir(),
            git_http_addr: default_git_http_addr(),
            git_http_advertise_addr: default_git_http_advertise_addr(),
            master_candidate: default_master_candidate(),
        }
    }
}

/// Command-line flags. Anything set here overrides the same field loaded
/// from `--config`; anything left unset falls back to the file (or the
/// file's own default, if the file didn't set it either).
#[derive(Parser, Debug)]
#[command(name = "confd-coordinator", version, about = "Watches KV-stored app descriptors, fetches their Git snapshots, republishes them as KV bundles")]
pub struct Args {
    /// Path to a TOML config file. Missing file is treated as all-defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub consul_address: Option<String>,

    #[arg(long)]
    pub descriptor_prefix: Option<String>,

    #[arg(long)]
    pub output_prefix: Option<String>,

    #[arg(long)]
    pub leader_key: Option<String>,

    #[arg(long)]
    pub repos_dir: Option<PathBuf>,

    #[arg(long)]
    pub git_http_addr: Option<String>,

    #[arg(long)]
    pub git_http_advertise_addr: Option<String>,

    /// This node's human-readable name, used as the Consul session name.
    #[arg(long, default_value = "confd-coordinator")]
    pub node_name: String,

    /// Whether this node contends for leadership at all. Defaults to true;
    /// pass `--master-candidate=false` to run a node that only ever follows.
    #[arg(long)]
    pub master_candidate: Option<bool>,
}

/// The fully resolved configuration the coordinator actually runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub consul_address: String,
    pub monitor_period: Duration,
    pub watch_period: Duration,
    pub descriptor_prefix: String,
    pub output_prefix: String,
    pub leader_key: String,
    pub session_ttl: Duration,
    pub repos_dir: PathBuf,
    pub git_http_addr: String,
    pub git_http_advertise_addr: String,
    pub node_name: String,
    pub master_candidate: bool,
}

impl Config {
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config file {path:?}: {e}"))?;
                toml::from_str(&contents).map_err(|e| anyhow::anyhow!("parsing config file {path:?}: {e}"))?
            }
            None => FileConfig::default(),
        };

        Ok(Self {
            consul_address: args.consul_address.clone().unwrap_or(file.consul_address),
            monitor_period: Duration::from_secs(file.monitor_period_secs),
            watch_period: Duration::from_secs(file.watch_period_secs),
            descriptor_prefix: args.descriptor_prefix.clone().unwrap_or(file.descriptor_prefix),
            output_prefix: args.output_prefix.clone().unwrap_or(file.output_prefix),
            leader_key: args.leader_key.clone().unwrap_or(file.leader_key),
            session_ttl: Duration::from_secs(file.session_ttl_secs),
            repos_dir: args.repos_dir.clone().unwrap_or(file.repos_dir),
            git_http_addr: args.git_http_addr.clone().unwrap_or(file.git_http_addr),
            git_http_advertise_addr: args
                .git_http_advertise_addr
                .clone()
                .unwrap_or(file.git_http_advertise_addr),
            node_name: args.node_name.clone(),
            master_candidate: args.master_candidate.unwrap_or(file.master_candidate),
        })
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;

    use super::*;

    #[googletest::test]
    fn empty_file_config_matches_defaults() {
        let file: FileConfig = toml::from_str("").unwrap();
        assert_eq!(file.consul_address, "localhost:8500");
        assert_eq!(file.monitor_period_secs, 3);
        assert_eq!(file.watch_period_secs, 1);
    }

    #[googletest::test]
    fn unknown_field_is_rejected() {
        let result: Result<FileConfig, _> = toml::from_str("bogus_field = true");
        expect_that!(result, err(anything()));
    }

    #[googletest::test]
    fn cli_flag_overrides_file_value() {
        let args = Args {
            config: None,
            consul_address: Some("consul.internal:8500".to_owned()),
            descriptor_prefix: None,
            output_prefix: None,
            leader_key: None,
            repos_dir: None,
            git_http_addr: None,
            git_http_advertise_addr: None,
            node_name: "node-a".to_owned(),
            master_candidate: None,
        };
        let config = Config::load(&args).unwrap();
        assert_eq!(config.consul_address, "consul.internal:8500");
        assert_eq!(config.descriptor_prefix, "config/global");
        assert!(config.master_candidate);
    }

    #[googletest::test]
    fn master_candidate_flag_overrides_default() {
        let args = Args {
            config: None,
            consul_address: None,
            descriptor_prefix: None,
            output_prefix: None,
            leader_key: None,
            repos_dir: None,
            git_http_addr: None,
            git_http_advertise_addr: None,
            node_name: "node-a".to_owned(),
            master_candidate: Some(false),
        };
        let config = Config::load(&args).unwrap();
        assert!(!config.master_candidate);
    }
}
