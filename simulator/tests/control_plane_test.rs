#![cfg(feature = "integ")]
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use simulator::{
    apiserver, generate_certs, run_embedded_etcd, ApiServerConfig, CancellationToken, Error,
    Simulator, SimulatorSettings, State,
};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration, Instant};

/// How long kube-apiserver gets to create its system namespaces after it reports ready.
const NAMESPACE_TIMEOUT: Duration = Duration::from_secs(30);

/// A store that is gone must be reported well before the startup timeout.
const FAIL_FAST: Duration = Duration::from_secs(10);

const HOSTNAMES: [&str; 2] = ["localhost", "127.0.0.1"];

fn init() -> SimulatorSettings {
    let _ = env_logger::builder().is_test(true).try_init();
    SimulatorSettings::from_env().unwrap()
}

async fn start(dir: &TempDir, token: &CancellationToken) -> Simulator {
    let mut simulator = Simulator::new(dir.path(), HOSTNAMES, init(), token);
    simulator.start().await.unwrap();
    assert_eq!(simulator.state(), State::ServingReady);
    simulator
}

/// Start a control plane, list namespaces, and find `default`.
#[tokio::test]
async fn default_namespace_is_listed() {
    let dir = TempDir::new().unwrap();
    let mut simulator = start(&dir, &CancellationToken::new()).await;
    let client = simulator.k8s_client().await.unwrap();
    let api = Api::<Namespace>::all(client);

    let deadline = Instant::now() + NAMESPACE_TIMEOUT;
    loop {
        let names: Vec<String> = api
            .list(&ListParams::default())
            .await
            .unwrap()
            .into_iter()
            .map(|namespace| namespace.name_any())
            .collect();
        if names.iter().any(|name| name == "default") {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "'default' namespace not found in {:?}",
            names
        );
        sleep(Duration::from_millis(500)).await;
    }

    simulator.shutdown().await;
    assert_eq!(simulator.state(), State::Stopped);
}

#[tokio::test]
async fn kubeconfig_reaches_the_server() {
    let dir = TempDir::new().unwrap();
    let mut simulator = start(&dir, &CancellationToken::new()).await;
    let path = dir.path().join("admin.kubeconfig");
    simulator.generate_kubeconfig(&path).unwrap();

    let kubeconfig = Kubeconfig::read_from(&path).unwrap();
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .unwrap();
    let client = Client::try_from(config).unwrap();
    let version = client.apiserver_version().await.unwrap();
    assert!(!version.git_version.is_empty());

    simulator.shutdown().await;
}

#[tokio::test]
async fn stopped_store_fails_fast() {
    let settings = init();
    let dir = TempDir::new().unwrap();
    let certs = generate_certs(HOSTNAMES, dir.path()).unwrap();
    let store_token = CancellationToken::new();
    let etcd = run_embedded_etcd(&store_token, &dir.path().join("store"), &certs, &settings)
        .await
        .unwrap();
    let mut config = ApiServerConfig::new(certs, etcd.clone(), settings).unwrap();

    store_token.cancel();
    etcd.stopped().await;
    assert!(!etcd.data_dir().exists());

    let started = Instant::now();
    let err = timeout(FAIL_FAST, config.run_apiserver(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::ApiServerStartup {
                source: apiserver::Error::StoreStopped { .. }
            }
        ),
        "{}",
        err
    );
    assert!(started.elapsed() < FAIL_FAST);
    assert!(config.endpoint().is_none());
}

#[tokio::test]
async fn cancellation_stops_everything() {
    let dir = TempDir::new().unwrap();
    let token = CancellationToken::new();
    let mut simulator = start(&dir, &token).await;
    let apiserver = simulator.apiserver().unwrap().clone();
    let etcd = simulator.etcd().unwrap().clone();
    assert!(etcd.data_dir().exists());

    token.cancel();
    apiserver.stopped().await;
    etcd.stopped().await;

    assert!(apiserver.process().is_stopped());
    assert!(etcd.process().is_stopped());
    assert!(TcpStream::connect(apiserver.bind_address()).await.is_err());
    assert!(!etcd.data_dir().exists());
    simulator.shutdown().await;
    assert_eq!(simulator.state(), State::Stopped);
}

#[tokio::test]
async fn apiserver_stops_before_store() {
    let dir = TempDir::new().unwrap();
    let mut simulator = start(&dir, &CancellationToken::new()).await;
    let apiserver = simulator.apiserver().unwrap().clone();
    let etcd = simulator.etcd().unwrap().clone();

    // By the time etcd is gone kube-apiserver must no longer be listening.
    let store_stopped = tokio::spawn(async move {
        etcd.stopped().await;
        TcpStream::connect(apiserver.bind_address()).await.is_err()
    });
    simulator.shutdown().await;
    assert!(store_stopped.await.unwrap());
}
