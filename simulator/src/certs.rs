/*!

The certificate authority for a simulated control plane. A single self-signed root signs one
server identity for etcd, one for kube-apiserver and one client identity for the cluster
administrator. Everything is written as PEM under fixed names so the runners (and anybody
debugging a session) can find it.

!*/

use crate::files::write_atomic;
use log::{debug, info};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use snafu::{ensure, ResultExt, Snafu};
use std::fmt::{self, Debug, Display, Formatter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const SERVICE_ACCOUNT_KEY_FILE: &str = "sa.key";
pub const SERVICE_ACCOUNT_PUB_FILE: &str = "sa.pub";

/// The user name and group of the administrator identity. Membership in `system:masters` is what
/// grants the administrator full access under RBAC.
pub const ADMIN_COMMON_NAME: &str = "kubernetes-admin";
pub const ADMIN_ORGANIZATION: &str = "system:masters";

const ORGANIZATION: &str = "simulator";
const VALIDITY_DAYS: i64 = 365;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("At least one hostname is required"))]
    NoHostnames,

    #[snafu(display(
        "'{}' is neither an IP address nor a valid DNS name: {}",
        name,
        source
    ))]
    InvalidHostname { name: String, source: rcgen::Error },

    #[snafu(display("Unable to generate the {} key: {}", what, source))]
    KeyGeneration { what: String, source: rcgen::Error },

    #[snafu(display("Unable to sign the {} certificate: {}", what, source))]
    Sign { what: String, source: rcgen::Error },

    #[snafu(display("Unable to load the CA as an issuer: {}", source))]
    Issuer { source: rcgen::Error },

    #[snafu(display("Unable to create directory '{}': {}", path.display(), source))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to write '{}': {}", path.display(), source))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The identities signed by the simulator CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// etcd's server identity, also used for peer traffic.
    Etcd,
    /// kube-apiserver's serving identity.
    ApiServer,
    /// The cluster administrator's client identity.
    Admin,
}

impl Role {
    pub fn cert_file(&self) -> &'static str {
        match self {
            Role::Etcd => "etcd.crt",
            Role::ApiServer => "apiserver.crt",
            Role::Admin => "admin.crt",
        }
    }

    pub fn key_file(&self) -> &'static str {
        match self {
            Role::Etcd => "etcd.key",
            Role::ApiServer => "apiserver.key",
            Role::Admin => "admin.key",
        }
    }

    fn is_server(&self) -> bool {
        !matches!(self, Role::Admin)
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let (common_name, organization) = match self {
            Role::Etcd => ("etcd", ORGANIZATION),
            Role::ApiServer => ("kube-apiserver", ORGANIZATION),
            Role::Admin => (ADMIN_COMMON_NAME, ADMIN_ORGANIZATION),
        };
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(organization.to_string()),
        );
        dn
    }

    fn extended_key_usages(&self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            Role::Etcd => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            Role::ApiServer => vec![ExtendedKeyUsagePurpose::ServerAuth],
            Role::Admin => vec![ExtendedKeyUsagePurpose::ClientAuth],
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Role::Etcd => write!(f, "etcd"),
            Role::ApiServer => write!(f, "kube-apiserver"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// A certificate and its private key, both in memory and on disk.
#[derive(Clone)]
pub struct IssuedCert {
    cert_pem: String,
    key_pem: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    sans: Vec<String>,
}

impl IssuedCert {
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// The hostnames and addresses the certificate is valid for. Empty for client identities.
    pub fn sans(&self) -> &[String] {
        &self.sans
    }

    /// The certificate followed by its key, the form TLS clients take an identity in.
    pub(crate) fn identity_pem(&self) -> String {
        format!("{}\n{}", self.cert_pem.trim_end(), self.key_pem)
    }
}

impl Debug for IssuedCert {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCert")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("sans", &self.sans)
            .finish_non_exhaustive()
    }
}

/// The key pair kube-apiserver signs and verifies service account tokens with.
#[derive(Debug, Clone)]
pub struct ServiceAccountKey {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
}

impl ServiceAccountKey {
    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    pub fn public_key_path(&self) -> &Path {
        &self.public_key_path
    }
}

/// The files a TLS endpoint is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// The root CA and every identity it signed for one session. The bundle is never modified after
/// `generate_certs` returns it.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    dir: PathBuf,
    hostnames: Vec<String>,
    ca: IssuedCert,
    etcd: IssuedCert,
    apiserver: IssuedCert,
    admin: IssuedCert,
    service_account: ServiceAccountKey,
}

impl CertificateBundle {
    /// The directory the PEM files were written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn ca(&self) -> &IssuedCert {
        &self.ca
    }

    pub fn get(&self, role: Role) -> &IssuedCert {
        match role {
            Role::Etcd => &self.etcd,
            Role::ApiServer => &self.apiserver,
            Role::Admin => &self.admin,
        }
    }

    pub fn service_account(&self) -> &ServiceAccountKey {
        &self.service_account
    }

    pub fn tls_files(&self, role: Role) -> TlsFiles {
        let issued = self.get(role);
        TlsFiles {
            ca_cert: self.ca.cert_path.clone(),
            cert: issued.cert_path.clone(),
            key: issued.key_path.clone(),
        }
    }

    /// Returns `true` if the server certificates were issued for `host`. IP addresses are compared
    /// as addresses, names without regard to case.
    pub fn covers(&self, host: &str) -> bool {
        match host.parse::<IpAddr>() {
            Ok(ip) => self
                .hostnames
                .iter()
                .any(|name| name.parse::<IpAddr>().map_or(false, |other| other == ip)),
            Err(_) => self
                .hostnames
                .iter()
                .any(|name| name.eq_ignore_ascii_case(host)),
        }
    }
}

/// Create a root CA and the etcd, kube-apiserver and admin identities it signs, valid for every
/// entry in `hostnames`, and write them to `output_dir`. Nothing is written unless every key and
/// certificate was generated.
pub fn generate_certs<I, S>(hostnames: I, output_dir: &Path) -> crate::Result<CertificateBundle>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Ok(issue(hostnames, output_dir)?)
}

fn issue<I, S>(hostnames: I, output_dir: &Path) -> Result<CertificateBundle>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = Vec::new();
    for name in hostnames {
        let name = name.as_ref().trim();
        if !name.is_empty() && !names.iter().any(|existing| existing == name) {
            names.push(name.to_string());
        }
    }
    ensure!(!names.is_empty(), NoHostnamesSnafu);
    let sans = names
        .iter()
        .map(|name| subject_alt_name(name))
        .collect::<Result<Vec<_>>>()?;

    info!("Generating simulator certificates for {:?}", names);
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("simulator-ca".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        dn
    };
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut ca_params);
    let ca_key = KeyPair::generate().context(KeyGenerationSnafu { what: "CA" })?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context(SignSnafu { what: "CA" })?;
    let ca_cert_pem = ca_cert.pem();
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key).context(IssuerSnafu)?;

    let ca = IssuedCert {
        cert_path: output_dir.join(CA_CERT_FILE),
        key_path: output_dir.join(CA_KEY_FILE),
        cert_pem: ca_cert.pem(),
        key_pem: ca_key.serialize_pem(),
        sans: Vec::new(),
    };
    let etcd = sign_leaf(Role::Etcd, &names, &sans, &issuer, output_dir)?;
    let apiserver = sign_leaf(Role::ApiServer, &names, &sans, &issuer, output_dir)?;
    let admin = sign_leaf(Role::Admin, &names, &sans, &issuer, output_dir)?;

    let sa_key = KeyPair::generate().context(KeyGenerationSnafu {
        what: "service account",
    })?;
    let service_account = ServiceAccountKey {
        private_key_path: output_dir.join(SERVICE_ACCOUNT_KEY_FILE),
        public_key_path: output_dir.join(SERVICE_ACCOUNT_PUB_FILE),
    };

    std::fs::create_dir_all(output_dir).context(CreateDirSnafu { path: output_dir })?;
    for issued in [&ca, &etcd, &apiserver, &admin] {
        write_pem(&issued.cert_path, &issued.cert_pem)?;
        write_pem(&issued.key_path, &issued.key_pem)?;
    }
    write_pem(&service_account.private_key_path, &sa_key.serialize_pem())?;
    write_pem(&service_account.public_key_path, &sa_key.public_key_pem())?;
    info!("Wrote simulator certificates to '{}'", output_dir.display());

    Ok(CertificateBundle {
        dir: output_dir.to_path_buf(),
        hostnames: names,
        ca,
        etcd,
        apiserver,
        admin,
        service_account,
    })
}

fn sign_leaf<S>(
    role: Role,
    names: &[String],
    sans: &[SanType],
    issuer: &Issuer<'_, S>,
    output_dir: &Path,
) -> Result<IssuedCert>
where
    S: rcgen::SigningKey,
{
    let mut params = CertificateParams::default();
    params.distinguished_name = role.distinguished_name();
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = role.extended_key_usages();
    if role.is_server() {
        params.subject_alt_names = sans.to_vec();
    }
    set_validity(&mut params);

    let key = KeyPair::generate().context(KeyGenerationSnafu {
        what: role.to_string(),
    })?;
    let cert = params.signed_by(&key, issuer).context(SignSnafu {
        what: role.to_string(),
    })?;
    debug!("Signed the {} certificate", role);
    Ok(IssuedCert {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert_path: output_dir.join(role.cert_file()),
        key_path: output_dir.join(role.key_file()),
        sans: if role.is_server() {
            names.to_vec()
        } else {
            Vec::new()
        },
    })
}

fn write_pem(path: &Path, contents: &str) -> Result<()> {
    write_atomic(path, contents.as_bytes()).context(WriteFileSnafu { path })
}

fn subject_alt_name(name: &str) -> Result<SanType> {
    match name.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => Ia5String::try_from(name.to_string())
            .map(SanType::DnsName)
            .context(InvalidHostnameSnafu { name }),
    }
}

fn set_validity(params: &mut CertificateParams) {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
}
