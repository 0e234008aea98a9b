use clap::Parser;
use std::path::PathBuf;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CLAWRDEN_BUILD_TARGET"),
    ", rustc ",
    env!("CLAWRDEN_BUILD_RUSTC"),
    ", built ",
    env!("CLAWRDEN_BUILD_DATE"),
    ")",
);

#[derive(Parser, Debug)]
#[command(
    name = "clawrden-warden",
    version,
    long_version = LONG_VERSION,
    about = "Zero-trust command-interception supervisor for autonomous agents in Linux containers"
)]
pub(crate) struct Cli {
    /// Unix socket the shim connects to
    #[arg(long, default_value = "/var/run/clawrden/warden.sock")]
    pub(crate) socket: PathBuf,

    /// Policy file (YAML); falls back to the restrictive default on any
    /// read/parse failure
    #[arg(long, default_value = "/etc/clawrden/policy.yaml")]
    pub(crate) policy: PathBuf,

    /// Append-only newline-delimited JSON audit log
    #[arg(long, default_value = "/var/lib/clawrden/audit.ndjson")]
    pub(crate) audit: PathBuf,

    /// HTTP API listen address (host:port); omit to disable the API
    #[arg(long)]
    pub(crate) api: Option<String>,

    /// Directory holding the master shim binary
    #[arg(long = "armory-path", default_value = "/var/lib/clawrden/armory")]
    pub(crate) armory_path: PathBuf,

    /// Directory holding per-jail bin/ symlink trees
    #[arg(long = "jailhouse-path", default_value = "/var/lib/clawrden/jailhouse")]
    pub(crate) jailhouse_path: PathBuf,

    /// Persisted jailhouse state file
    #[arg(long = "state-path", default_value = "/var/lib/clawrden/jailhouse.state.json")]
    pub(crate) state_path: PathBuf,

    /// Disable the policy file watcher (enabled by default)
    #[arg(long = "no-watch")]
    pub(crate) no_watch: bool,
}
