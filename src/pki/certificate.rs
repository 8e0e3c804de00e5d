use anyhow::{anyhow, Context, Result};
use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
use rand::RngCore;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::sha2::Sha256;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::SystemTime;
use ::time::OffsetDateTime;
use x509_cert::builder::{Builder, CertificateBuilder, Profile, RequestBuilder};
use x509_cert::der::asn1::{Ia5String, OctetString};
use x509_cert::der::pem::LineEnding;
use x509_cert::der::{Decode, EncodePem};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages, SubjectAltName,
};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use super::URI_SCHEME;

/// Options for generating a new certificate or certificate signing request.
#[derive(Clone)]
pub struct CertOptions {
    /// Comma-separated hostnames, IPs or identity URIs the certificate is
    /// issued for. May also be a single workload identity such as a
    /// Kubernetes service account.
    pub host: String,

    /// Validity bounds of the issued certificate.
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,

    /// Signer certificate; unset for self-signed certificates.
    pub signer_cert: Option<Certificate>,

    /// Signer private key; unset for self-signed certificates.
    pub signer_key: Option<RsaPrivateKey>,

    /// Organization for the certificate subject.
    pub org: String,

    /// Whether the certificate is a certificate authority.
    pub is_ca: bool,

    /// Whether the certificate is self-signed.
    pub is_self_signed: bool,

    /// Whether the certificate is used on the client side.
    pub is_client: bool,

    /// Whether the certificate is used on the server side.
    pub is_server: bool,

    /// Size of the generated RSA private key in bits.
    pub rsa_key_size: usize,
}

impl Default for CertOptions {
    fn default() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            host: String::new(),
            not_before: now,
            not_after: now,
            signer_cert: None,
            signer_key: None,
            org: String::new(),
            is_ca: false,
            is_self_signed: false,
            is_client: false,
            is_server: false,
            rsa_key_size: 2048,
        }
    }
}

/// Generate an X.509 certificate with the given options.
///
/// A fresh RSA keypair is generated; the public half is bound to the
/// certificate and the private half is returned next to it. The certificate
/// is signed by the freshly generated key in the self-signed case, otherwise
/// by the signer key from the options.
///
/// Returns the PEM-encoded certificate and the PKCS#1 PEM-encoded private key.
pub fn gen_cert(options: &CertOptions) -> Result<(String, String)> {
    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, options.rsa_key_size).context("RSA key generation failed")?;

    let issuer = if options.is_self_signed {
        None
    } else {
        let signer_cert = options
            .signer_cert
            .as_ref()
            .ok_or_else(|| anyhow!("signer certificate is required for a non-self-signed cert"))?;
        Some(signer_cert.tbs_certificate.subject.clone())
    };
    let signer_key = if options.is_self_signed {
        private_key.clone()
    } else {
        options
            .signer_key
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow!("signer private key is required for a non-self-signed cert"))?
    };
    let signer = SigningKey::<Sha256>::new(signer_key);

    let mut builder = CertificateBuilder::new(
        Profile::Manual { issuer },
        gen_serial()?,
        validity_between(options.not_before, options.not_after)?,
        org_subject(&options.org)?,
        subject_public_key_info(&private_key)?,
        &signer,
    )
    .context("failed to assemble the certificate template")?;

    builder
        .add_extension(&BasicConstraints {
            ca: options.is_ca,
            path_len_constraint: None,
        })
        .context("failed to add basic constraints")?;

    // A CA key is only allowed to sign other certificates; leaf keys sign
    // and encipher on their own behalf.
    let key_usage = if options.is_ca {
        KeyUsage(KeyUsages::KeyCertSign.into())
    } else {
        KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment)
    };
    builder
        .add_extension(&key_usage)
        .context("failed to add key usage")?;

    let mut ext_key_usages = Vec::new();
    if options.is_server {
        ext_key_usages.push(ID_KP_SERVER_AUTH);
    }
    if options.is_client {
        ext_key_usages.push(ID_KP_CLIENT_AUTH);
    }
    if !ext_key_usages.is_empty() {
        builder
            .add_extension(&ExtendedKeyUsage(ext_key_usages))
            .context("failed to add extended key usage")?;
    }

    if !options.host.is_empty() {
        builder
            .add_extension(&build_subject_alt_name(&options.host)?)
            .context("failed to add the subject alternative name extension")?;
    }

    let certificate = builder
        .build::<Signature>()
        .context("could not create certificate")?;

    let cert_pem = certificate
        .to_pem(LineEnding::LF)
        .context("failed to PEM-encode the certificate")?;
    let key_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .context("failed to PEM-encode the private key")?
        .to_string();
    Ok((cert_pem, key_pem))
}

/// Generate a PKCS#10 certificate signing request with the given options.
///
/// The hosts travel in a subject-alternative-name extension inside the
/// request's extension attribute, the same shape they end up with in the
/// issued certificate.
///
/// Returns the PEM-encoded CSR and the PKCS#1 PEM-encoded private key.
pub fn gen_csr(options: &CertOptions) -> Result<(String, String)> {
    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, options.rsa_key_size).context("RSA key generation failed")?;
    let signer = SigningKey::<Sha256>::new(private_key.clone());

    let mut builder = RequestBuilder::new(org_subject(&options.org)?, &signer)
        .context("failed to assemble the certificate request")?;
    if !options.host.is_empty() {
        builder
            .add_extension(&build_subject_alt_name(&options.host)?)
            .context("failed to add the subject alternative name extension")?;
    }

    let request = builder
        .build::<Signature>()
        .context("could not create certificate request")?;

    let csr_pem = request
        .to_pem(LineEnding::LF)
        .context("failed to PEM-encode the certificate request")?;
    let key_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .context("failed to PEM-encode the private key")?
        .to_string();
    Ok((csr_pem, key_pem))
}

/// Build the SAN extension for a comma-separated host list.
///
/// IP addresses are carried with the 4-byte form when possible, identity
/// URIs as URI names and everything else as DNS names, in input order.
fn build_subject_alt_name(host: &str) -> Result<SubjectAltName> {
    let mut names = Vec::new();
    for h in host.split(',') {
        let name = if let Ok(ip) = h.parse::<IpAddr>() {
            let bytes = match ip.to_canonical() {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            GeneralName::IpAddress(OctetString::new(bytes).context("invalid IP address bytes")?)
        } else if h.starts_with(&format!("{URI_SCHEME}:")) {
            GeneralName::UniformResourceIdentifier(
                Ia5String::new(h).map_err(|_| anyhow!("host is not a valid IA5 string: {h}"))?,
            )
        } else {
            GeneralName::DnsName(
                Ia5String::new(h).map_err(|_| anyhow!("host is not a valid IA5 string: {h}"))?,
            )
        };
        names.push(name);
    }
    Ok(SubjectAltName(names))
}

/// Fresh random 128-bit serial number, masked positive.
fn gen_serial() -> Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::new(&bytes).context("failed to generate serial number")
}

fn org_subject(org: &str) -> Result<Name> {
    if org.is_empty() {
        return Ok(Name::default());
    }
    Name::from_str(&format!("O={org}")).with_context(|| format!("invalid organization: {org}"))
}

fn validity_between(not_before: OffsetDateTime, not_after: OffsetDateTime) -> Result<Validity> {
    Ok(Validity {
        not_before: Time::try_from(SystemTime::from(not_before))
            .context("invalid notBefore time")?,
        not_after: Time::try_from(SystemTime::from(not_after)).context("invalid notAfter time")?,
    })
}

fn subject_public_key_info(private_key: &RsaPrivateKey) -> Result<SubjectPublicKeyInfoOwned> {
    let public_der = RsaPublicKey::from(private_key)
        .to_public_key_der()
        .context("failed to encode the RSA public key")?;
    SubjectPublicKeyInfoOwned::from_der(public_der.as_bytes())
        .context("failed to parse the RSA public key info")
}
