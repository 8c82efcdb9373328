use crate::apiserver::{ApiServerConfig, ApiServerEndpoint};
use crate::certs::{generate_certs, CertificateBundle};
use crate::error::{self, Result};
use crate::etcd::{run_embedded_etcd, EtcdEndpoint};
use crate::kubeconfig;
use crate::settings::SimulatorSettings;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use log::{debug, info, warn};
use snafu::{OptionExt, ResultExt};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// The directory under the work dir that holds the etcd data.
pub const STORE_DIR: &str = "store";

/// Where a [`Simulator`] session is in its lifecycle. Sessions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Uninitialized,
    CertsReady,
    StoreReady,
    ServingReady,
    Stopped,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Uninitialized => "uninitialized",
            State::CertsReady => "certs-ready",
            State::StoreReady => "store-ready",
            State::ServingReady => "serving-ready",
            State::Stopped => "stopped",
        };
        Display::fmt(s, f)
    }
}

/// # Simulator
///
/// A throwaway control plane: a CA, a single-member etcd and a kube-apiserver, all living in
/// `work_dir` and all stopped when the session is shut down or dropped.
///
/// ```no_run
/// # async fn run() -> simulator::Result<()> {
/// use simulator::{CancellationToken, Simulator, SimulatorSettings};
///
/// let token = CancellationToken::new();
/// let mut simulator = Simulator::new(
///     "/tmp/simulator",
///     ["localhost", "127.0.0.1"],
///     SimulatorSettings::from_env()?,
///     &token,
/// );
/// simulator.start().await?;
/// simulator.generate_kubeconfig("/tmp/simulator/admin.kubeconfig")?;
/// let client = simulator.k8s_client().await?;
/// // ...
/// simulator.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Simulator {
    work_dir: PathBuf,
    hostnames: Vec<String>,
    settings: SimulatorSettings,
    token: CancellationToken,
    state: State,
    certs: Option<CertificateBundle>,
    etcd: Option<EtcdEndpoint>,
    apiserver: Option<ApiServerConfig>,
}

impl Simulator {
    /// Create a session. Cancelling `token` stops the session, but shutting the session down does
    /// not cancel `token`.
    pub fn new<P, I, S>(
        work_dir: P,
        hostnames: I,
        settings: SimulatorSettings,
        token: &CancellationToken,
    ) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            work_dir: work_dir.into(),
            hostnames: hostnames.into_iter().map(Into::into).collect(),
            settings,
            token: token.child_token(),
            state: State::Uninitialized,
            certs: None,
            etcd: None,
            apiserver: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn certs(&self) -> Option<&CertificateBundle> {
        self.certs.as_ref()
    }

    pub fn etcd(&self) -> Option<&EtcdEndpoint> {
        self.etcd.as_ref()
    }

    pub fn apiserver(&self) -> Option<&ApiServerEndpoint> {
        self.apiserver.as_ref().and_then(ApiServerConfig::endpoint)
    }

    /// The session's cancellation token. Cancelling it has the same effect as dropping the
    /// session.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Issue the session's certificates into the work dir.
    pub fn generate_certs(&mut self) -> Result<&CertificateBundle> {
        self.expect_state(State::Uninitialized, "generate certificates")?;
        match generate_certs(&self.hostnames, &self.work_dir) {
            Ok(certs) => {
                self.state = State::CertsReady;
                Ok(self.certs.insert(certs))
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Start etcd and allocate the address kube-apiserver will serve on.
    pub async fn start_store(&mut self) -> Result<&EtcdEndpoint> {
        self.expect_state(State::CertsReady, "start the store")?;
        let certs = self.certs.clone().context(error::ConfigurationSnafu {
            message: "certificates are missing",
        })?;
        let data_dir = self.work_dir.join(STORE_DIR);
        let started = run_embedded_etcd(&self.token, &data_dir, &certs, &self.settings).await;
        let etcd = match started {
            Ok(etcd) => self.etcd.insert(etcd).clone(),
            Err(e) => return Err(self.abandon(e).await),
        };
        match ApiServerConfig::new(certs, etcd, self.settings.clone()) {
            Ok(apiserver) => self.apiserver = Some(apiserver),
            Err(e) => return Err(self.abandon(e).await),
        }
        self.state = State::StoreReady;
        self.etcd().context(error::ConfigurationSnafu {
            message: "etcd did not report an endpoint",
        })
    }

    /// Start kube-apiserver against the session's etcd.
    pub async fn start_apiserver(&mut self) -> Result<&ApiServerEndpoint> {
        self.expect_state(State::StoreReady, "start the API server")?;
        let token = self.token.clone();
        let apiserver = self
            .apiserver
            .as_mut()
            .context(error::ConfigurationSnafu {
                message: "the API server was not prepared",
            })?;
        let started = apiserver.run_apiserver(&token).await;
        if let Err(e) = started {
            return Err(self.abandon(e).await);
        }
        self.state = State::ServingReady;
        self.apiserver().context(error::ConfigurationSnafu {
            message: "the API server did not report an endpoint",
        })
    }

    /// Run every transition up to a serving control plane.
    pub async fn start(&mut self) -> Result<()> {
        self.generate_certs()?;
        self.start_store().await?;
        self.start_apiserver().await?;
        info!(
            "Simulated control plane in '{}' is ready",
            self.work_dir.display()
        );
        Ok(())
    }

    /// Write an administrator kubeconfig to `path`. The API server does not need to be running yet.
    pub fn generate_kubeconfig<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if !matches!(self.state, State::StoreReady | State::ServingReady) {
            return self.wrong_state("generate a kubeconfig");
        }
        self.apiserver
            .as_ref()
            .context(error::ConfigurationSnafu {
                message: "the API server was not prepared",
            })?
            .generate_kubeconfig(path.as_ref())
    }

    /// A client authenticated as the administrator of the running API server.
    pub async fn k8s_client(&self) -> Result<Client> {
        self.expect_state(State::ServingReady, "create a client")?;
        let config = self.apiserver.as_ref().context(error::ConfigurationSnafu {
            message: "the API server was not prepared",
        })?;
        let certs = config.certs.as_ref().context(error::ConfigurationSnafu {
            message: "certificates are missing",
        })?;
        let yaml = kubeconfig::render(&config.server_url()?, certs)?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml).context(error::KubeconfigReadSnafu)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context(error::ClientConfigSnafu)?;
        Client::try_from(config).context(error::ClientCreateSnafu)
    }

    /// Stop kube-apiserver, then etcd, and wait for both to be gone. Safe to call in any state.
    pub async fn shutdown(&mut self) {
        if self.state != State::Stopped {
            info!(
                "Shutting down simulated control plane in '{}'",
                self.work_dir.display()
            );
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.token.cancel();
        if let Some(apiserver) = self.apiserver() {
            apiserver.stopped().await;
        }
        if let Some(etcd) = &self.etcd {
            etcd.stopped().await;
        }
        if self.state != State::Stopped {
            debug!("Session moved from {} to {}", self.state, State::Stopped);
        }
        self.state = State::Stopped;
    }

    /// Tear down whatever a failed transition left running.
    async fn abandon(&mut self, error: crate::Error) -> crate::Error {
        warn!("Stopping the session after a failed transition: {}", error);
        self.teardown().await;
        error
    }

    fn fail(&mut self) {
        self.token.cancel();
        self.state = State::Stopped;
    }

    fn expect_state(&self, expected: State, action: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            self.wrong_state(action)
        }
    }

    fn wrong_state<T>(&self, action: &str) -> Result<T> {
        error::ConfigurationSnafu {
            message: format!("cannot {} while the session is {}", action, self.state),
        }
        .fail()
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        if !self.token.is_cancelled() {
            warn!(
                "Simulator in '{}' dropped while {}, stopping it in the background",
                self.work_dir.display(),
                self.state
            );
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(etcd_path: PathBuf) -> SimulatorSettings {
        SimulatorSettings {
            etcd_path,
            startup_timeout_secs: 2,
            poll_interval_ms: 50,
            shutdown_grace_secs: 5,
            ..SimulatorSettings::default()
        }
    }

    fn simulator(dir: &TempDir, token: &CancellationToken) -> Simulator {
        Simulator::new(
            dir.path(),
            ["localhost", "127.0.0.1"],
            settings(dir.path().join("no-such-etcd")),
            token,
        )
    }

    fn assert_configuration<T>(result: Result<T>) {
        match result {
            Ok(_) => panic!("expected a configuration error"),
            Err(e) => assert!(matches!(e, Error::Configuration { .. }), "{}", e),
        }
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut simulator = simulator(&dir, &CancellationToken::new());
        assert_eq!(simulator.state(), State::Uninitialized);

        assert_configuration(simulator.start_store().await);
        assert_configuration(simulator.start_apiserver().await);
        assert_configuration(simulator.generate_kubeconfig(dir.path().join("kubeconfig")));
        assert_configuration(simulator.k8s_client().await);
        // Rejected calls leave the session where it was.
        assert_eq!(simulator.state(), State::Uninitialized);

        simulator.generate_certs().unwrap();
        assert_eq!(simulator.state(), State::CertsReady);
        assert_configuration(simulator.generate_certs());
        assert_configuration(simulator.start_apiserver().await);
        assert_configuration(simulator.generate_kubeconfig(dir.path().join("kubeconfig")));
        assert_eq!(simulator.state(), State::CertsReady);
        assert!(!dir.path().join("kubeconfig").exists());
    }

    #[tokio::test]
    async fn error_names_the_state() {
        let dir = TempDir::new().unwrap();
        let mut simulator = simulator(&dir, &CancellationToken::new());
        let err = simulator.start_apiserver().await.unwrap_err();
        assert!(err.to_string().contains("uninitialized"), "{}", err);
    }

    #[tokio::test]
    async fn failed_store_stops_the_session() {
        let dir = TempDir::new().unwrap();
        let parent = CancellationToken::new();
        let mut simulator = simulator(&dir, &parent);
        simulator.generate_certs().unwrap();

        let err = simulator.start_store().await.unwrap_err();
        assert!(matches!(err, Error::StoreStartup { .. }), "{}", err);
        assert_eq!(simulator.state(), State::Stopped);
        assert!(simulator.token().is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!dir.path().join(STORE_DIR).exists());

        assert_configuration(simulator.start_store().await);
        assert_configuration(simulator.start().await);
    }

    #[tokio::test]
    async fn failed_certs_stop_the_session() {
        let dir = TempDir::new().unwrap();
        let mut simulator = Simulator::new(
            dir.path(),
            Vec::<String>::new(),
            SimulatorSettings::default(),
            &CancellationToken::new(),
        );
        let err = simulator.generate_certs().unwrap_err();
        assert!(matches!(err, Error::CertGeneration { .. }), "{}", err);
        assert_eq!(simulator.state(), State::Stopped);
    }

    #[tokio::test]
    async fn start_reports_the_failing_layer() {
        let dir = TempDir::new().unwrap();
        let mut simulator = simulator(&dir, &CancellationToken::new());
        let err = simulator.start().await.unwrap_err();
        assert!(matches!(err, Error::StoreStartup { .. }), "{}", err);
        assert_eq!(simulator.state(), State::Stopped);
        assert!(simulator.certs().is_some());
        assert!(simulator.etcd().is_none());
        assert!(simulator.apiserver().is_none());
    }

    #[tokio::test]
    async fn shutdown_from_any_state() {
        let dir = TempDir::new().unwrap();
        let mut simulator = simulator(&dir, &CancellationToken::new());
        simulator.shutdown().await;
        assert_eq!(simulator.state(), State::Stopped);
        assert_configuration(simulator.generate_certs());
        // A second shutdown is a no-op.
        tokio::time::timeout(Duration::from_secs(1), simulator.shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn drop_cancels_only_the_session() {
        let dir = TempDir::new().unwrap();
        let parent = CancellationToken::new();
        let simulator = simulator(&dir, &parent);
        let session = simulator.token().clone();
        drop(simulator);
        assert!(session.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn parent_cancellation_reaches_the_session() {
        let dir = TempDir::new().unwrap();
        let parent = CancellationToken::new();
        let simulator = simulator(&dir, &parent);
        parent.cancel();
        assert!(simulator.token().is_cancelled());
    }
}
