use crate::error::{self, Result};
use serde::Deserialize;
use snafu::ResultExt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// The prefix of the environment variables read by [`SimulatorSettings::from_env`].
pub const ENV_PREFIX: &str = "SIMULATOR_";

/// Settings shared by the etcd and kube-apiserver runners. Every field has a default, so
/// `SimulatorSettings::default()` works on a machine where `etcd` and `kube-apiserver` are found via
/// `$PATH`.
///
/// # Example
///
/// ```text
/// SIMULATOR_ETCD_PATH=/wherever/etcd
/// SIMULATOR_KUBE_APISERVER_PATH=/wherever/kube-apiserver
/// SIMULATOR_STARTUP_TIMEOUT_SECS=120
/// SIMULATOR_APISERVER_ARGS=--v=4,--feature-gates=AllAlpha=false
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SimulatorSettings {
    /// The path or name of the `etcd` binary.
    #[serde(default = "etcd")]
    pub etcd_path: PathBuf,

    /// The path or name of the `kube-apiserver` binary.
    #[serde(default = "kube_apiserver")]
    pub kube_apiserver_path: PathBuf,

    /// The address every listener binds to. It must be among the hostnames the certificates are
    /// issued for.
    #[serde(default = "loopback")]
    pub bind_address: IpAddr,

    /// How long a runner waits for its process to pass the readiness probe.
    #[serde(default = "startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// The pause between two readiness probes.
    #[serde(default = "poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a killed process is given to exit before teardown moves on.
    #[serde(default = "shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Keep the webhook admission plugins enabled.
    #[serde(default)]
    pub admission_webhooks: bool,

    #[serde(default = "service_cluster_ip_range")]
    pub service_cluster_ip_range: String,

    /// Extra arguments appended to the `etcd` command line.
    #[serde(default)]
    pub etcd_args: Vec<String>,

    /// Extra arguments appended to the `kube-apiserver` command line.
    #[serde(default)]
    pub apiserver_args: Vec<String>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            etcd_path: etcd(),
            kube_apiserver_path: kube_apiserver(),
            bind_address: loopback(),
            startup_timeout_secs: startup_timeout_secs(),
            poll_interval_ms: poll_interval_ms(),
            shutdown_grace_secs: shutdown_grace_secs(),
            admission_webhooks: false,
            service_cluster_ip_range: service_cluster_ip_range(),
            etcd_args: Vec::new(),
            apiserver_args: Vec::new(),
        }
    }
}

impl SimulatorSettings {
    /// Read the settings from `SIMULATOR_*` environment variables, using defaults for anything
    /// that is not set.
    pub fn from_env() -> Result<Self> {
        envy::prefixed(ENV_PREFIX)
            .from_env::<Self>()
            .context(error::SettingsSnafu)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// We need these to provide defaults for serde.

fn etcd() -> PathBuf {
    PathBuf::from("etcd")
}

fn kube_apiserver() -> PathBuf {
    PathBuf::from("kube-apiserver")
}

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn startup_timeout_secs() -> u64 {
    60
}

fn poll_interval_ms() -> u64 {
    250
}

fn shutdown_grace_secs() -> u64 {
    10
}

fn service_cluster_ip_range() -> String {
    String::from("10.0.0.0/24")
}
