use crate::certs::{CertificateBundle, Role};
use log::trace;
use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};
use std::time::Duration;
use url::Url;

/// Upper bound for a single health request. The overall wait is bounded by the startup timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Unable to load TLS material for the health probe: {}", source))]
    Tls { source: reqwest::Error },

    #[snafu(display("Unable to build the health probe client: {}", source))]
    Client { source: reqwest::Error },

    #[snafu(display("Unable to build health URL from '{}': {}", base, source))]
    Url {
        base: String,
        source: url::ParseError,
    },

    #[snafu(display("Health request to '{}' failed: {}", url, source))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("'{}' answered {}: {}", url, status, body))]
    Unhealthy {
        url: String,
        status: u16,
        body: String,
    },
}

/// How a successful answer is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// etcd's `/health` document must say `"health": "true"`.
    EtcdHealth,
    /// Any 2xx answer.
    Success,
}

#[derive(Debug, Deserialize)]
struct EtcdHealth {
    health: String,
}

/// An HTTPS health check that trusts only the simulator CA and authenticates as the administrator.
#[derive(Debug, Clone)]
pub(crate) struct HealthProbe {
    client: reqwest::Client,
    url: Url,
    expect: Expect,
}

impl HealthProbe {
    pub(crate) fn new(
        base: &Url,
        path: &str,
        expect: Expect,
        certs: &CertificateBundle,
    ) -> Result<Self, Error> {
        let ca = reqwest::Certificate::from_pem(certs.ca().cert_pem().as_bytes())
            .context(TlsSnafu)?;
        let identity = reqwest::Identity::from_pem(certs.get(Role::Admin).identity_pem().as_bytes())
            .context(TlsSnafu)?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .no_proxy()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(ClientSnafu)?;
        let url = base.join(path).context(UrlSnafu {
            base: base.as_str(),
        })?;
        Ok(Self {
            client,
            url,
            expect,
        })
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    /// Issue one health request.
    pub(crate) async fn check(&self) -> Result<(), Error> {
        let url = self.url.as_str();
        trace!("Probing '{}'", url);
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .context(RequestSnafu { url })?;
        let status = response.status();
        let body = response.text().await.context(RequestSnafu { url })?;
        ensure!(
            status.is_success(),
            UnhealthySnafu {
                url,
                status: status.as_u16(),
                body: body.trim(),
            }
        );
        if self.expect == Expect::EtcdHealth {
            let healthy = serde_json::from_str::<EtcdHealth>(&body)
                .map(|health| health.health == "true")
                .unwrap_or(false);
            ensure!(
                healthy,
                UnhealthySnafu {
                    url,
                    status: status.as_u16(),
                    body: body.trim(),
                }
            );
        }
        Ok(())
    }
}
