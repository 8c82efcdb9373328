/*!

A throwaway Kubernetes control plane for tests. A [`Simulator`] session issues its own CA and
certificates, runs a single-member etcd and a kube-apiserver as child processes on ephemeral
loopback ports, writes an administrator kubeconfig, and removes all of it again when the session's
[`CancellationToken`] is cancelled.

The pieces can also be used on their own: [`generate_certs`], [`run_embedded_etcd`] and
[`ApiServerConfig::run_apiserver`].

!*/

#![deny(
    clippy::expect_used,
    clippy::get_unwrap,
    clippy::panic,
    clippy::panic_in_result_fn,
    clippy::panicking_unwrap,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]

pub use apiserver::{ApiServerConfig, ApiServerEndpoint};
pub use certs::{generate_certs, CertificateBundle, IssuedCert, Role, ServiceAccountKey, TlsFiles};
pub use error::{Error, Result};
pub use etcd::{run_embedded_etcd, EtcdEndpoint};
pub use process::ProcessHandle;
pub use settings::SimulatorSettings;
pub use simulator::{Simulator, State};
pub use tokio_util::sync::CancellationToken;

pub mod apiserver;
pub mod certs;
mod error;
pub mod etcd;
mod files;
pub mod kubeconfig;
mod ports;
pub mod probe;
pub mod process;
pub mod settings;
mod simulator;
