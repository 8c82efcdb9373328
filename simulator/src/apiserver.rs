use crate::certs::{CertificateBundle, Role, TlsFiles};
use crate::error::{self as crate_error, Result as CrateResult};
use crate::etcd::{flag_url, https_url, EtcdEndpoint};
use crate::kubeconfig;
use crate::probe::{self, Expect, HealthProbe};
use crate::process::{self, Cleanup, Launch, ProcessHandle, Timing};
use crate::settings::SimulatorSettings;
use log::{debug, info};
use snafu::{OptionExt, ResultExt, Snafu};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const LOG_FILE: &str = "kube-apiserver.log";
const READY_PATH: &str = "/readyz";
const SERVICE_ACCOUNT_ISSUER: &str = "https://kubernetes.default.svc.cluster.local";
/// Admission plugins that call out to webhooks, which a simulated cluster has nobody to serve.
const WEBHOOK_ADMISSION_PLUGINS: &str = "MutatingAdmissionWebhook,ValidatingAdmissionWebhook";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("etcd at '{}' has been stopped", url))]
    StoreStopped { url: String },

    #[snafu(display("etcd at '{}' is unreachable: {}", url, source))]
    StoreUnreachable { url: String, source: probe::Error },

    #[snafu(display("Unable to allocate a port: {}", source))]
    AllocatePort { source: std::io::Error },

    #[snafu(display("The certificates do not cover the bind address '{}'", host))]
    HostNotCertified { host: String },

    #[snafu(display("{}", source))]
    Url { source: crate::etcd::Error },

    #[snafu(context(false), display("{}", source))]
    Probe { source: probe::Error },

    #[snafu(context(false), display("{}", source))]
    Process { source: process::Error },
}

/// A running kube-apiserver that passed its readiness check.
#[derive(Debug, Clone)]
pub struct ApiServerEndpoint {
    bind_address: SocketAddr,
    url: Url,
    tls: TlsFiles,
    etcd: EtcdEndpoint,
    process: ProcessHandle,
}

impl ApiServerEndpoint {
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn tls(&self) -> &TlsFiles {
        &self.tls
    }

    /// The store this API server persists through.
    pub fn etcd(&self) -> &EtcdEndpoint {
        &self.etcd
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Completes once kube-apiserver has stopped.
    pub async fn stopped(&self) {
        self.process.stopped().await
    }
}

/// # API Server Config
///
/// Holds what kube-apiserver needs before it can start: the session's certificates, a running
/// etcd, and the address to serve on. Set `certs` and `etcd` (or use [`ApiServerConfig::new`]),
/// then call [`ApiServerConfig::run_apiserver`].
///
/// The bind address is allocated before the server starts, so a kubeconfig can be generated
/// before, during or after startup.
#[derive(Debug, Clone, Default)]
pub struct ApiServerConfig {
    pub certs: Option<CertificateBundle>,
    pub etcd: Option<EtcdEndpoint>,
    pub bind_address: Option<SocketAddr>,
    pub settings: SimulatorSettings,
    endpoint: Option<ApiServerEndpoint>,
}

impl ApiServerConfig {
    /// Create a config for `certs` and `etcd` with a freshly allocated bind address.
    pub fn new(
        certs: CertificateBundle,
        etcd: EtcdEndpoint,
        settings: SimulatorSettings,
    ) -> CrateResult<Self> {
        let mut config = Self {
            certs: Some(certs),
            etcd: Some(etcd),
            bind_address: None,
            settings,
            endpoint: None,
        };
        config.allocate_bind_address()?;
        Ok(config)
    }

    /// Pick an ephemeral port on the configured bind address.
    pub fn allocate_bind_address(&mut self) -> CrateResult<SocketAddr> {
        let addr = crate::ports::allocate(self.settings.bind_address, 1)
            .context(AllocatePortSnafu)?
            .into_iter()
            .next()
            .context(crate_error::ConfigurationSnafu {
                message: "no port was allocated",
            })?;
        debug!("kube-apiserver will listen on {}", addr);
        self.bind_address = Some(addr);
        Ok(addr)
    }

    /// The URL clients reach the API server at.
    pub fn server_url(&self) -> CrateResult<Url> {
        let addr = self.bind_address.context(crate_error::ConfigurationSnafu {
            message: "the API server has no bind address",
        })?;
        Ok(https_url(&addr.to_string()).context(UrlSnafu)?)
    }

    /// The running API server, once `run_apiserver` has succeeded.
    pub fn endpoint(&self) -> Option<&ApiServerEndpoint> {
        self.endpoint.as_ref()
    }

    /// Write an administrator kubeconfig for this API server to `path`. Only the certificates and
    /// the bind address are needed, the server does not have to be running.
    pub fn generate_kubeconfig(&self, path: &Path) -> CrateResult<()> {
        let certs = self
            .certs
            .as_ref()
            .context(crate_error::ConfigurationSnafu {
                message: "certificates are required to generate a kubeconfig",
            })?;
        let url = self.server_url()?;
        kubeconfig::write(path, &url, certs)?;
        Ok(())
    }

    /// Start kube-apiserver against the configured etcd and return once `/readyz` succeeds.
    /// kube-apiserver runs until `token` is cancelled. etcd is not stopped before it.
    pub async fn run_apiserver(&mut self, token: &CancellationToken) -> CrateResult<()> {
        if self.endpoint.is_some() {
            return crate_error::ConfigurationSnafu {
                message: "the API server has already been started",
            }
            .fail();
        }
        let certs = self
            .certs
            .clone()
            .context(crate_error::ConfigurationSnafu {
                message: "certificates are required to run the API server",
            })?;
        let etcd = self.etcd.clone().context(crate_error::ConfigurationSnafu {
            message: "etcd is required to run the API server",
        })?;
        let bind_address = match self.bind_address {
            Some(addr) => addr,
            None => self.allocate_bind_address()?,
        };
        let endpoint = start(token, bind_address, &certs, etcd, &self.settings).await?;
        self.endpoint = Some(endpoint);
        Ok(())
    }
}

async fn start(
    token: &CancellationToken,
    bind_address: SocketAddr,
    certs: &CertificateBundle,
    etcd: EtcdEndpoint,
    settings: &SimulatorSettings,
) -> Result<ApiServerEndpoint, Error> {
    let host = bind_address.ip().to_string();
    snafu::ensure!(certs.covers(&host), HostNotCertifiedSnafu { host });

    // Fail fast rather than letting kube-apiserver retry a store that is not there.
    let hold = etcd.process().hold().context(StoreStoppedSnafu {
        url: etcd.client_url().as_str(),
    })?;
    etcd.check_health().await.context(StoreUnreachableSnafu {
        url: etcd.client_url().as_str(),
    })?;

    let url = https_url(&bind_address.to_string()).context(UrlSnafu)?;
    let tls = certs.tls_files(Role::ApiServer);
    let mut args = apiserver_args(bind_address, certs, etcd.client_url(), settings);
    args.extend(settings.apiserver_args.iter().map(OsString::from));

    let probe = HealthProbe::new(&url, READY_PATH, Expect::Success, certs)?;
    let starting = Launch {
        name: "kube-apiserver",
        program: settings.kube_apiserver_path.clone(),
        args,
        log_path: certs.dir().join(LOG_FILE),
    }
    .spawn(Cleanup::default(), Some(hold))?;
    let process = starting.start(&probe, token, Timing::from(settings)).await?;
    info!("kube-apiserver is serving at '{}'", url);

    Ok(ApiServerEndpoint {
        bind_address,
        url,
        tls,
        etcd,
        process,
    })
}

/// The flags that point kube-apiserver at etcd and the session certificates.
fn apiserver_args(
    bind_address: SocketAddr,
    certs: &CertificateBundle,
    etcd_url: &Url,
    settings: &SimulatorSettings,
) -> Vec<OsString> {
    let tls = certs.tls_files(Role::ApiServer);
    let admin = certs.tls_files(Role::Admin);
    let service_account = certs.service_account();

    let mut args: Vec<OsString> = Vec::new();
    let mut arg = |flag: &str, value: OsString| {
        let mut pair = OsString::from(format!("--{}=", flag));
        pair.push(value);
        args.push(pair);
    };
    arg("etcd-servers", flag_url(etcd_url).into());
    arg("etcd-cafile", admin.ca_cert.into());
    arg("etcd-certfile", admin.cert.into());
    arg("etcd-keyfile", admin.key.into());
    arg("bind-address", bind_address.ip().to_string().into());
    arg("secure-port", bind_address.port().to_string().into());
    arg("advertise-address", bind_address.ip().to_string().into());
    arg("cert-dir", certs.dir().into());
    arg("tls-cert-file", tls.cert.into());
    arg("tls-private-key-file", tls.key.into());
    arg("client-ca-file", tls.ca_cert.into());
    arg("authorization-mode", "RBAC".into());
    arg(
        "service-cluster-ip-range",
        settings.service_cluster_ip_range.as_str().into(),
    );
    arg("service-account-issuer", SERVICE_ACCOUNT_ISSUER.into());
    arg(
        "service-account-key-file",
        service_account.public_key_path().into(),
    );
    arg(
        "service-account-signing-key-file",
        service_account.private_key_path().into(),
    );
    arg("allow-privileged", "true".into());
    if !settings.admission_webhooks {
        arg("disable-admission-plugins", WEBHOOK_ADMISSION_PLUGINS.into());
    }
    args
}
