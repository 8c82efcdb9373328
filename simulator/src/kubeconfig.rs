use crate::certs::{CertificateBundle, Role};
use crate::files::write_atomic;
use log::info;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use url::Url;

pub const CLUSTER_NAME: &str = "simulator";
pub const USER_NAME: &str = "admin";
pub const CONTEXT_NAME: &str = "simulator-admin";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Unable to serialize kubeconfig: {}", source))]
    Serialize { source: serde_yaml::Error },

    #[snafu(display("Unable to write kubeconfig '{}': {}", path.display(), source))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct Config {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    current_context: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    certificate_authority_data: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct User {
    client_certificate_data: String,
    client_key_data: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Context {
    cluster: String,
    user: String,
}

/// Render a kubeconfig for the administrator of the cluster served at `server`. The output only
/// depends on its inputs.
pub(crate) fn render(server: &Url, certs: &CertificateBundle) -> Result<String, Error> {
    let admin = certs.get(Role::Admin);
    let config = Config {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME.to_string(),
            cluster: Cluster {
                server: server.as_str().trim_end_matches('/').to_string(),
                certificate_authority_data: base64::encode(certs.ca().cert_pem()),
            },
        }],
        users: vec![NamedUser {
            name: USER_NAME.to_string(),
            user: User {
                client_certificate_data: base64::encode(admin.cert_pem()),
                client_key_data: base64::encode(admin.key_pem()),
            },
        }],
        contexts: vec![NamedContext {
            name: CONTEXT_NAME.to_string(),
            context: Context {
                cluster: CLUSTER_NAME.to_string(),
                user: USER_NAME.to_string(),
            },
        }],
        current_context: CONTEXT_NAME.to_string(),
    };
    serde_yaml::to_string(&config).context(SerializeSnafu)
}

/// Render the kubeconfig and replace `path` with it in one step.
pub(crate) fn write(path: &Path, server: &Url, certs: &CertificateBundle) -> Result<(), Error> {
    let yaml = render(server, certs)?;
    write_atomic(path, yaml.as_bytes()).context(WriteSnafu { path })?;
    info!("Wrote kubeconfig for '{}' to '{}'", server, path.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::certs::generate_certs;
    use kube::config::Kubeconfig;
    use tempfile::TempDir;

    fn server() -> Url {
        Url::parse("https://127.0.0.1:6443").unwrap()
    }

    #[test]
    fn readable_by_kube() {
        let dir = TempDir::new().unwrap();
        let certs = generate_certs(["localhost", "127.0.0.1"], dir.path()).unwrap();
        let path = dir.path().join("admin.kubeconfig");
        write(&path, &server(), &certs).unwrap();

        let kubeconfig = Kubeconfig::read_from(&path).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some(CONTEXT_NAME));
        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(kubeconfig.auth_infos.len(), 1);
        assert_eq!(kubeconfig.contexts.len(), 1);
    }

    #[test]
    fn embeds_ca_and_admin_identity() {
        let dir = TempDir::new().unwrap();
        let certs = generate_certs(["127.0.0.1"], dir.path()).unwrap();
        let yaml = render(&server(), &certs).unwrap();
        let config: Config = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(config.api_version, "v1");
        assert_eq!(config.kind, "Config");
        assert_eq!(config.clusters[0].cluster.server, "https://127.0.0.1:6443");
        let ca = base64::decode(&config.clusters[0].cluster.certificate_authority_data).unwrap();
        assert_eq!(String::from_utf8(ca).unwrap(), certs.ca().cert_pem());
        let admin = certs.get(Role::Admin);
        let cert = base64::decode(&config.users[0].user.client_certificate_data).unwrap();
        assert_eq!(String::from_utf8(cert).unwrap(), admin.cert_pem());
        let key = base64::decode(&config.users[0].user.client_key_data).unwrap();
        assert_eq!(String::from_utf8(key).unwrap(), admin.key_pem());
        assert_eq!(config.contexts[0].context.cluster, CLUSTER_NAME);
        assert_eq!(config.contexts[0].context.user, USER_NAME);
    }

    #[test]
    fn identical_inputs_identical_bytes() {
        let dir = TempDir::new().unwrap();
        let certs = generate_certs(["localhost", "127.0.0.1"], dir.path()).unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        write(&first, &server(), &certs).unwrap();
        write(&second, &server(), &certs).unwrap();
        assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
    }
}
