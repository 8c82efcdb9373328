use crate::{apiserver, certs, etcd, kubeconfig};
use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for a simulated control plane session. The startup variants are kept apart so a
/// caller can tell whether the storage layer or the serving layer failed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(context(false), display("Unable to generate certificates: {}", source))]
    CertGeneration { source: certs::Error },

    #[snafu(context(false), display("Unable to start etcd: {}", source))]
    StoreStartup { source: etcd::Error },

    #[snafu(context(false), display("Unable to start kube-apiserver: {}", source))]
    ApiServerStartup { source: apiserver::Error },

    #[snafu(display("Invalid simulator configuration: {}", message))]
    Configuration { message: String },

    #[snafu(context(false), display("Unable to write kubeconfig: {}", source))]
    Kubeconfig { source: kubeconfig::Error },

    #[snafu(display("Unable to read kubeconfig: {}", source))]
    KubeconfigRead {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Unable to create client: {}", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Unable to create client config: {}", source))]
    ClientConfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Unable to parse simulator settings: {}", source))]
    Settings { source: envy::Error },
}
