use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment the node agent attests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    OnPrem,
    Gcp,
    Aws,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "onprem" => Ok(Self::OnPrem),
            "gcp" => Ok(Self::Gcp),
            "aws" => Ok(Self::Aws),
            other => Err(anyhow!("Invalid env {other} specified")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::OnPrem => "onprem",
            Self::Gcp => "gcp",
            Self::Aws => "aws",
        };
        f.write_str(tag)
    }
}

/// Node agent configuration, provided from the CLI.
#[derive(Debug, Clone)]
pub struct NodeAgentConfig {
    /// Istio CA gRPC address.
    pub ca_address: String,

    /// Identity the certificate is requested for; when empty the platform
    /// client is asked for one at startup.
    pub service_identity: String,

    /// Organization for the service identity.
    pub service_identity_org: String,

    /// Size of the generated private key in bits.
    pub rsa_key_size: usize,

    /// The environment this node agent runs on.
    pub env: Environment,

    /// Where the issued certificate chain is written.
    pub service_cert_file: PathBuf,

    /// Where the issued private key is written.
    pub service_key_file: PathBuf,

    /// Node identity cert chain file (on-prem attestation input).
    pub cert_chain_file: PathBuf,

    /// Node identity private key file (on-prem attestation input).
    pub platform_key_file: PathBuf,

    /// Root cert file used to authenticate the CA's server certificate.
    pub root_cert_file: PathBuf,

    /// Initial interval between CSR retries.
    pub csr_retry_interval: Duration,

    /// Number of retries before the agent gives up.
    pub csr_max_retries: u32,

    /// Grace period length as a percentage of the whole certificate TTL.
    pub csr_grace_period_percentage: u8,
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            ca_address: "istio-ca:8060".to_string(),
            service_identity: String::new(),
            service_identity_org: String::new(),
            rsa_key_size: 1024,
            env: Environment::OnPrem,
            service_cert_file: PathBuf::from("serviceIdentityCert.pem"),
            service_key_file: PathBuf::from("serviceIdentityKey.pem"),
            cert_chain_file: PathBuf::from("/etc/certs/cert-chain.pem"),
            platform_key_file: PathBuf::from("/etc/certs/key.pem"),
            root_cert_file: PathBuf::from("/etc/certs/root-cert.pem"),
            csr_retry_interval: crate::agent::CSR_RETRY_INTERVAL,
            csr_max_retries: crate::agent::CSR_MAX_RETRIES,
            csr_grace_period_percentage: crate::agent::CSR_GRACE_PERIOD_PERCENTAGE,
        }
    }
}

impl NodeAgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ca_address.is_empty() {
            bail!("Istio CA address is empty");
        }
        if self.rsa_key_size < 512 {
            bail!("RSA key size must be at least 512 bits");
        }
        if self.csr_grace_period_percentage == 0 || self.csr_grace_period_percentage >= 100 {
            bail!("grace period percentage must be within (0, 100)");
        }
        Ok(())
    }
}

/// Istio CA configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// gRPC listen address.
    pub listen_address: SocketAddr,

    /// Organization for the self-signed root certificate.
    pub org: String,

    /// Trust domain workload identities are minted under.
    pub trust_domain: String,

    /// TTL of issued workload certificates, in seconds.
    pub cert_ttl_secs: u64,

    /// TTL of the self-signed CA certificate, in seconds.
    pub ca_cert_ttl_secs: u64,

    /// Bootstrap a self-signed root instead of loading signing material.
    pub self_signed: bool,

    /// Signing certificate file (ignored when self-signed).
    pub signing_cert_file: Option<PathBuf>,

    /// Signing private key file (ignored when self-signed).
    pub signing_key_file: Option<PathBuf>,

    /// Root certificate file (ignored when self-signed).
    pub root_cert_file: Option<PathBuf>,

    /// Intermediate certificate chain file, appended to issued certs.
    pub cert_chain_file: Option<PathBuf>,

    /// Server TLS certificate file; plaintext when unset.
    pub tls_cert_file: Option<PathBuf>,

    /// Server TLS private key file.
    pub tls_key_file: Option<PathBuf>,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8060".parse().unwrap(),
            org: "istio-ca".to_string(),
            trust_domain: crate::pki::DEFAULT_TRUST_DOMAIN.to_string(),
            cert_ttl_secs: 3600,
            ca_cert_ttl_secs: 365 * 24 * 3600,
            self_signed: true,
            signing_cert_file: None,
            signing_key_file: None,
            root_cert_file: None,
            cert_chain_file: None,
            tls_cert_file: None,
            tls_key_file: None,
        }
    }
}

impl CaConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: CaConfig = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn cert_ttl(&self) -> time::Duration {
        time::Duration::seconds(self.cert_ttl_secs as i64)
    }

    pub fn ca_cert_ttl(&self) -> time::Duration {
        time::Duration::seconds(self.ca_cert_ttl_secs as i64)
    }

    /// Validate configuration. Exactly one of self-signed bootstrap or
    /// provided signing material must be selected.
    pub fn validate(&self) -> Result<()> {
        if self.cert_ttl_secs == 0 {
            bail!("certificate TTL must be greater than 0");
        }

        let has_signing_files = self.signing_cert_file.is_some()
            || self.signing_key_file.is_some()
            || self.root_cert_file.is_some();
        if self.self_signed && has_signing_files {
            bail!("a self-signed CA cannot take signing material files");
        }
        if !self.self_signed
            && (self.signing_cert_file.is_none()
                || self.signing_key_file.is_none()
                || self.root_cert_file.is_none())
        {
            bail!("signing cert, signing key and root cert files are required unless self-signed");
        }

        if self.tls_cert_file.is_some() != self.tls_key_file.is_some() {
            bail!("server TLS requires both a certificate and a key file");
        }
        Ok(())
    }
}
