use anyhow::{bail, Result};
use rsa::RsaPrivateKey;
use ::time::{Duration, OffsetDateTime};
use x509_cert::Certificate;

use super::certificate::{gen_cert, CertOptions};
use super::validator::{
    parse_pem_encoded_certificate, parse_pem_encoded_key, verify_cert_chain, PrivateKey,
};
use super::{spiffe_identity, DEFAULT_TRUST_DOMAIN};

/// The size of a private key for a leaf certificate.
pub const LEAF_KEY_SIZE: usize = 1024;

/// The size of a private key for a self-signed Istio CA.
pub const CA_KEY_SIZE: usize = 2048;

/// Configuration for creating an Istio CA.
pub struct IstioCaOptions {
    pub cert_chain_pem: Vec<u8>,
    pub cert_ttl: Duration,
    pub signing_cert_pem: Vec<u8>,
    pub signing_key_pem: Vec<u8>,
    pub root_cert_pem: Vec<u8>,
    pub trust_domain: String,
}

/// Generates keys and certificates for Istio identities.
///
/// All state is fixed at construction, so a single instance can serve
/// concurrent signing requests without synchronization.
#[derive(Debug)]
pub struct IstioCa {
    cert_ttl: Duration,
    trust_domain: String,

    signing_cert: Certificate,
    signing_key: RsaPrivateKey,

    signing_cert_pem: Vec<u8>,
    cert_chain_pem: Vec<u8>,
    root_cert_pem: Vec<u8>,
}

impl IstioCa {
    /// Build a CA from existing signing material. Fails when the signing
    /// certificate does not verify under the provided root and chain.
    pub fn new(opts: &IstioCaOptions) -> Result<Self> {
        let signing_cert = parse_pem_encoded_certificate(&opts.signing_cert_pem)?;
        let signing_key = match parse_pem_encoded_key(&opts.signing_key_pem)? {
            PrivateKey::Rsa(key) => key,
            PrivateKey::Ec(_) => bail!("the signing key must be an RSA key"),
        };

        let ca = Self {
            cert_ttl: opts.cert_ttl,
            trust_domain: opts.trust_domain.clone(),
            signing_cert,
            signing_key,
            signing_cert_pem: opts.signing_cert_pem.clone(),
            cert_chain_pem: opts.cert_chain_pem.clone(),
            root_cert_pem: opts.root_cert_pem.clone(),
        };
        ca.verify()?;
        Ok(ca)
    }

    /// Bootstrap a CA by generating a self-signed root certificate and key.
    pub fn new_self_signed(
        ca_cert_ttl: Duration,
        cert_ttl: Duration,
        org: &str,
        trust_domain: &str,
    ) -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        let options = CertOptions {
            not_before: now,
            not_after: now + ca_cert_ttl,
            org: org.to_string(),
            is_ca: true,
            is_self_signed: true,
            rsa_key_size: CA_KEY_SIZE,
            ..Default::default()
        };
        let (cert_pem, key_pem) = gen_cert(&options)?;

        Self::new(&IstioCaOptions {
            cert_chain_pem: Vec::new(),
            cert_ttl,
            signing_cert_pem: cert_pem.clone().into_bytes(),
            signing_key_pem: key_pem.into_bytes(),
            root_cert_pem: cert_pem.into_bytes(),
            trust_domain: trust_domain.to_string(),
        })
    }

    /// Issue a certificate chain and key for the identity defined by the
    /// service account name and namespace.
    pub fn generate(&self, name: &str, namespace: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let id = spiffe_identity(&self.trust_domain, namespace, name);
        let now = OffsetDateTime::now_utc();
        let options = CertOptions {
            host: id,
            not_before: now,
            not_after: now + self.cert_ttl,
            signer_cert: Some(self.signing_cert.clone()),
            signer_key: Some(self.signing_key.clone()),
            is_ca: false,
            is_self_signed: false,
            is_client: true,
            is_server: true,
            rsa_key_size: LEAF_KEY_SIZE,
            ..Default::default()
        };
        let (cert_pem, key_pem) = gen_cert(&options)?;

        let mut chain = cert_pem.into_bytes();
        chain.extend_from_slice(&self.cert_chain_pem);
        Ok((chain, key_pem.into_bytes()))
    }

    /// The PEM-encoded root certificate.
    pub fn get_root_certificate(&self) -> Vec<u8> {
        self.root_cert_pem.clone()
    }

    /// Check that the cert chain, root cert and signing cert match.
    fn verify(&self) -> Result<()> {
        if verify_cert_chain(
            &self.signing_cert_pem,
            &self.cert_chain_pem,
            &self.root_cert_pem,
        )
        .is_err()
        {
            bail!(
                "invalid parameters: cannot verify the signing cert with the provided root chain and cert pool"
            );
        }
        Ok(())
    }
}
