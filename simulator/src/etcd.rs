use crate::certs::{CertificateBundle, Role, TlsFiles};
use crate::probe::{self, Expect, HealthProbe};
use crate::process::{self, Cleanup, Launch, ProcessHandle, Timing};
use crate::settings::SimulatorSettings;
use log::info;
use snafu::{ensure, ResultExt, Snafu};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use url::Url;

/// The member name of the single-node cluster.
pub const MEMBER_NAME: &str = "simulator";
pub const LOG_FILE: &str = "etcd.log";
const HEALTH_PATH: &str = "/health";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Data directory '{}' is already in use", path.display()))]
    DataDirInUse { path: PathBuf },

    #[snafu(display("Unable to create data directory '{}': {}", path.display(), source))]
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to allocate ports: {}", source))]
    AllocatePorts { source: std::io::Error },

    #[snafu(display("The certificates do not cover the bind address '{}'", host))]
    HostNotCertified { host: String },

    #[snafu(display("Unable to build URL for '{}': {}", address, source))]
    Url {
        address: String,
        source: url::ParseError,
    },

    #[snafu(context(false), display("{}", source))]
    Probe { source: probe::Error },

    #[snafu(context(false), display("{}", source))]
    Process { source: process::Error },
}

/// Where a running etcd can be reached, and what it was started with.
#[derive(Debug, Clone)]
pub struct EtcdEndpoint {
    client_url: Url,
    peer_url: Url,
    data_dir: PathBuf,
    tls: TlsFiles,
    probe: HealthProbe,
    process: ProcessHandle,
}

impl EtcdEndpoint {
    pub fn client_url(&self) -> &Url {
        &self.client_url
    }

    pub fn peer_url(&self) -> &Url {
        &self.peer_url
    }

    /// Removed when the store is torn down.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn tls(&self) -> &TlsFiles {
        &self.tls
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Completes once etcd has stopped and its data directory has been removed.
    pub async fn stopped(&self) {
        self.process.stopped().await
    }

    /// One health request against the client URL.
    pub(crate) async fn check_health(&self) -> std::result::Result<(), probe::Error> {
        self.probe.check().await
    }
}

/// Start a single-member etcd cluster that stores its data in `data_dir` and serves TLS on two
/// ephemeral loopback ports. Returns once etcd reports itself healthy. etcd runs until `token` is
/// cancelled, at which point it is stopped and `data_dir` is removed.
pub async fn run_embedded_etcd(
    token: &CancellationToken,
    data_dir: &Path,
    certs: &CertificateBundle,
    settings: &SimulatorSettings,
) -> crate::Result<EtcdEndpoint> {
    Ok(start(token, data_dir, certs, settings).await?)
}

async fn start(
    token: &CancellationToken,
    data_dir: &Path,
    certs: &CertificateBundle,
    settings: &SimulatorSettings,
) -> Result<EtcdEndpoint> {
    let ip = settings.bind_address;
    let host = ip.to_string();
    ensure!(certs.covers(&host), HostNotCertifiedSnafu { host });
    ensure!(!has_entries(data_dir)?, DataDirInUseSnafu { path: data_dir });
    std::fs::create_dir_all(data_dir).context(CreateDataDirSnafu { path: data_dir })?;
    let cleanup = Cleanup::default().remove_dir(data_dir);

    let addrs = crate::ports::allocate(ip, 2).context(AllocatePortsSnafu)?;
    let client_url = https_url(&addrs[0].to_string())?;
    let peer_url = https_url(&addrs[1].to_string())?;
    let tls = certs.tls_files(Role::Etcd);
    let mut args = etcd_args(data_dir, &client_url, &peer_url, &tls);
    args.extend(settings.etcd_args.iter().map(OsString::from));

    let probe = HealthProbe::new(&client_url, HEALTH_PATH, Expect::EtcdHealth, certs)?;
    let starting = Launch {
        name: "etcd",
        program: settings.etcd_path.clone(),
        args,
        log_path: certs.dir().join(LOG_FILE),
    }
    .spawn(cleanup, None)?;
    let process = starting.start(&probe, token, Timing::from(settings)).await?;
    info!("etcd is serving clients at '{}'", client_url);

    Ok(EtcdEndpoint {
        client_url,
        peer_url,
        data_dir: data_dir.to_path_buf(),
        tls,
        probe,
        process,
    })
}

/// The flags for a single-member cluster with mutual TLS on both the client and the peer port.
fn etcd_args(data_dir: &Path, client_url: &Url, peer_url: &Url, tls: &TlsFiles) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let mut arg = |flag: &str, value: OsString| {
        let mut pair = OsString::from(format!("--{}=", flag));
        pair.push(value);
        args.push(pair);
    };
    let client_url = flag_url(client_url);
    let peer_url = flag_url(peer_url);
    arg("name", MEMBER_NAME.into());
    arg("data-dir", data_dir.into());
    arg("listen-client-urls", client_url.into());
    arg("advertise-client-urls", client_url.into());
    arg("listen-peer-urls", peer_url.into());
    arg("initial-advertise-peer-urls", peer_url.into());
    arg("initial-cluster", format!("{}={}", MEMBER_NAME, peer_url).into());
    arg("initial-cluster-state", "new".into());
    arg("cert-file", tls.cert.clone().into());
    arg("key-file", tls.key.clone().into());
    arg("trusted-ca-file", tls.ca_cert.clone().into());
    arg("client-cert-auth", "true".into());
    arg("peer-cert-file", tls.cert.clone().into());
    arg("peer-key-file", tls.key.clone().into());
    arg("peer-trusted-ca-file", tls.ca_cert.clone().into());
    arg("peer-client-cert-auth", "true".into());
    args
}

/// A missing directory counts as empty. Any other failure to list it is an error.
fn has_entries(dir: &Path) -> Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(CreateDataDirSnafu { path: dir }),
    }
}

pub(crate) fn https_url(address: &str) -> Result<Url> {
    Url::parse(&format!("https://{}", address)).context(UrlSnafu { address })
}

/// `url` without the trailing `/` that [`Url`] always adds. etcd refuses URL flags with a path.
pub(crate) fn flag_url(url: &Url) -> &str {
    url.as_str().trim_end_matches('/')
}
