use anyhow::{anyhow, bail, Context, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use std::time::Duration;
use ::time::OffsetDateTime;
use x509_cert::der::Decode;
use x509_cert::Certificate;
use x509_parser::oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME;
use x509_parser::prelude::*;

const CERT_PEM_TAG: &str = "CERTIFICATE";
const RSA_KEY_PEM_TAG: &str = "RSA PRIVATE KEY";
const EC_KEY_PEM_TAG: &str = "EC PRIVATE KEY";

/// A parsed private key. Issuance only signs with RSA keys; EC keys are
/// parsed so callers can reject them with a precise error.
#[derive(Clone, Debug)]
pub enum PrivateKey {
    Rsa(RsaPrivateKey),
    Ec(p256::SecretKey),
}

/// Parse a single PEM block holding an X.509 certificate.
pub fn parse_pem_encoded_certificate(cert_pem: &[u8]) -> Result<Certificate> {
    let block = ::pem::parse(cert_pem).map_err(|_| anyhow!("Invalid PEM encoded certificate"))?;
    if block.tag() != CERT_PEM_TAG {
        bail!("Invalid PEM encoded certificate");
    }
    Certificate::from_der(block.contents())
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {e}"))
}

/// Parse a single PEM block holding a private key, trying PKCS#1 RSA first
/// and SEC1 EC second.
pub fn parse_pem_encoded_key(key_pem: &[u8]) -> Result<PrivateKey> {
    let block = ::pem::parse(key_pem).map_err(|_| anyhow!("Invalid PEM encoded key"))?;
    match block.tag() {
        RSA_KEY_PEM_TAG => {
            let key = RsaPrivateKey::from_pkcs1_der(block.contents())
                .map_err(|e| anyhow!("Failed to parse the RSA private key: {e}"))?;
            Ok(PrivateKey::Rsa(key))
        }
        EC_KEY_PEM_TAG => {
            let key = p256::SecretKey::from_sec1_der(block.contents())
                .map_err(|e| anyhow!("Failed to parse the EC private key: {e}"))?;
            Ok(PrivateKey::Ec(key))
        }
        other => bail!("Unsupported key algorithm: {other}"),
    }
}

/// Filter a certificate's extensions down to its SAN extensions
/// (OID 2.5.29.17).
pub fn extract_san_extensions<'a>(
    extensions: &'a [X509Extension<'a>],
) -> Vec<&'a X509Extension<'a>> {
    extensions
        .iter()
        .filter(|ext| ext.oid == OID_X509_EXT_SUBJECT_ALT_NAME)
        .collect()
}

/// Extract the workload identity URI from the SAN extension of the first
/// certificate in a PEM chain.
pub fn extract_spiffe_uri(cert_chain_pem: &[u8]) -> Result<String> {
    let block = ::pem::parse(cert_chain_pem).map_err(|_| anyhow!("Invalid PEM encoded certificate"))?;
    let (_, cert) = parse_x509_certificate(block.contents())
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {e}"))?;

    for ext in extract_san_extensions(cert.extensions()) {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::URI(uri) = name {
                    if uri.starts_with(super::URI_SCHEME) {
                        return Ok(uri.to_string());
                    }
                }
            }
        }
    }
    bail!("the certificate does not carry a workload identity URI in its SAN extension")
}

/// Verify that a certificate chains to one of the given roots through the
/// given intermediates, checking every signature along the walk.
pub fn verify_cert_chain(
    cert_pem: &[u8],
    intermediates_pem: &[u8],
    roots_pem: &[u8],
) -> Result<()> {
    let cert_der = decode_single_cert(cert_pem)?;
    let intermediate_ders = decode_cert_blocks(intermediates_pem)?;
    let root_ders = decode_cert_blocks(roots_pem)?;
    if root_ders.is_empty() {
        bail!("no root certificates provided");
    }

    let (_, cert) = parse_x509_certificate(&cert_der)
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {e}"))?;
    let intermediates = parse_all(&intermediate_ders)?;
    let roots = parse_all(&root_ders)?;

    if chains_to_root(&cert, &intermediates, &roots, intermediates.len() + 1) {
        Ok(())
    } else {
        bail!("the certificate does not chain to any of the provided roots")
    }
}

/// Compute how long to wait before renewing the given certificate.
///
/// The grace period is a percentage of the whole certificate lifetime, so a
/// certificate older than `(100 - pct)%` of its lifetime renews immediately.
pub fn get_wait_time(
    cert_pem: &[u8],
    now: OffsetDateTime,
    grace_period_percentage: u8,
) -> Result<Duration> {
    let block = ::pem::parse(cert_pem).map_err(|_| anyhow!("Invalid PEM encoded certificate"))?;
    let (_, cert) = parse_x509_certificate(block.contents())
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {e}"))?;

    let not_before = cert.validity().not_before.to_datetime();
    let not_after = cert.validity().not_after.to_datetime();

    let time_to_expire = not_after - now;
    if time_to_expire < ::time::Duration::ZERO {
        bail!("certificate already expired at {not_after}, but now is {now}");
    }

    let grace_period = (not_after - not_before) * i32::from(grace_period_percentage) / 100;
    let wait_time = time_to_expire - grace_period;
    if wait_time < ::time::Duration::ZERO {
        // Already inside the grace period: renew right away.
        return Ok(Duration::ZERO);
    }
    Duration::try_from(wait_time).context("wait time out of range")
}

fn decode_single_cert(cert_pem: &[u8]) -> Result<Vec<u8>> {
    let block = ::pem::parse(cert_pem).map_err(|_| anyhow!("Invalid PEM encoded certificate"))?;
    Ok(block.contents().to_vec())
}

fn decode_cert_blocks(pem_bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    if pem_bytes.is_empty() {
        return Ok(Vec::new());
    }
    let blocks =
        ::pem::parse_many(pem_bytes).map_err(|_| anyhow!("Invalid PEM encoded certificate"))?;
    Ok(blocks
        .into_iter()
        .filter(|block| block.tag() == CERT_PEM_TAG)
        .map(|block| block.contents().to_vec())
        .collect())
}

fn parse_all(ders: &[Vec<u8>]) -> Result<Vec<X509Certificate<'_>>> {
    ders.iter()
        .map(|der| {
            parse_x509_certificate(der)
                .map(|(_, cert)| cert)
                .map_err(|e| anyhow!("Failed to parse X.509 certificate: {e}"))
        })
        .collect()
}

fn chains_to_root(
    cert: &X509Certificate<'_>,
    intermediates: &[X509Certificate<'_>],
    roots: &[X509Certificate<'_>],
    depth: usize,
) -> bool {
    if depth == 0 {
        return false;
    }
    for root in roots {
        if cert.issuer() == root.subject() && cert.verify_signature(Some(root.public_key())).is_ok()
        {
            return true;
        }
    }
    for intermediate in intermediates {
        if cert.issuer() == intermediate.subject()
            && cert
                .verify_signature(Some(intermediate.public_key()))
                .is_ok()
            && chains_to_root(intermediate, intermediates, roots, depth - 1)
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::certificate::{gen_cert, CertOptions};
    use ::time::macros::datetime;

    fn cert_between(
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> (String, String) {
        let options = CertOptions {
            host: "workload.example.com".to_string(),
            not_before,
            not_after,
            org: "test.org".to_string(),
            is_self_signed: true,
            rsa_key_size: 1024,
            ..Default::default()
        };
        gen_cert(&options).unwrap()
    }

    #[test]
    fn test_cert_pem_parse_roundtrip() {
        let now = OffsetDateTime::now_utc();
        let (cert_pem, key_pem) = cert_between(now, now + ::time::Duration::hours(1));

        let cert = parse_pem_encoded_certificate(cert_pem.as_bytes()).unwrap();
        let reencoded = {
            use x509_cert::der::EncodePem;
            cert.to_pem(x509_cert::der::pem::LineEnding::LF).unwrap()
        };
        assert_eq!(cert_pem, reencoded);

        let key = match parse_pem_encoded_key(key_pem.as_bytes()).unwrap() {
            PrivateKey::Rsa(key) => key,
            _ => panic!("expected an RSA key"),
        };
        let reencoded = {
            use rsa::pkcs1::EncodeRsaPrivateKey;
            key.to_pkcs1_pem(x509_cert::der::pem::LineEnding::LF)
                .unwrap()
                .to_string()
        };
        assert_eq!(key_pem, reencoded);
    }

    #[test]
    fn test_parse_invalid_pem() {
        let err = parse_pem_encoded_certificate(b"not a pem").unwrap_err();
        assert_eq!(err.to_string(), "Invalid PEM encoded certificate");

        let err = parse_pem_encoded_key(b"not a pem").unwrap_err();
        assert_eq!(err.to_string(), "Invalid PEM encoded key");
    }

    #[test]
    fn test_parse_unsupported_key_type() {
        let block = ::pem::Pem::new("PRIVATE KEY", vec![0u8; 8]);
        let err = parse_pem_encoded_key(::pem::encode(&block).as_bytes()).unwrap_err();
        assert!(err.to_string().starts_with("Unsupported key algorithm"));
    }

    #[test]
    fn test_extract_spiffe_uri() {
        let now = OffsetDateTime::now_utc();
        let options = CertOptions {
            host: "spiffe://cluster.local/ns/bar/sa/foo".to_string(),
            not_before: now,
            not_after: now + ::time::Duration::hours(1),
            org: "test.org".to_string(),
            is_self_signed: true,
            rsa_key_size: 1024,
            ..Default::default()
        };
        let (cert_pem, _) = gen_cert(&options).unwrap();
        let uri = extract_spiffe_uri(cert_pem.as_bytes()).unwrap();
        assert_eq!(uri, "spiffe://cluster.local/ns/bar/sa/foo");
    }

    #[test]
    fn test_extract_spiffe_uri_missing() {
        let now = OffsetDateTime::now_utc();
        let (cert_pem, _) = cert_between(now, now + ::time::Duration::hours(1));
        assert!(extract_spiffe_uri(cert_pem.as_bytes()).is_err());
    }

    #[test]
    fn test_wait_time_with_grace_period() {
        // 24h lifetime, just under two hours in: with a 50% grace period the
        // renewal fires 36039.99999996s from now (10h and 40s minus the 40ns
        // already elapsed past the second boundary).
        let not_before = datetime!(2017-08-23 19:00:40 UTC);
        let not_after = datetime!(2017-08-24 19:00:40 UTC);
        let (cert_pem, _) = cert_between(not_before, not_after);

        let now = datetime!(2017-08-23 21:00:00.000000040 UTC);
        let wait = get_wait_time(cert_pem.as_bytes(), now, 50).unwrap();
        assert_eq!(wait.as_secs(), 36039);

        // On an exact second boundary the wait is exact too.
        let now = datetime!(2017-08-23 21:00:00 UTC);
        let wait = get_wait_time(cert_pem.as_bytes(), now, 50).unwrap();
        assert_eq!(wait, Duration::from_secs(36040));
    }

    #[test]
    fn test_wait_time_inside_grace_period() {
        let not_before = datetime!(2017-08-23 19:00:40 UTC);
        let not_after = datetime!(2017-08-24 19:00:40 UTC);
        let (cert_pem, _) = cert_between(not_before, not_after);

        // 23 hours in with a 50% grace period: renew immediately.
        let now = datetime!(2017-08-24 18:00:40 UTC);
        let wait = get_wait_time(cert_pem.as_bytes(), now, 50).unwrap();
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn test_wait_time_expired_cert() {
        let not_before = datetime!(2017-08-23 19:00:40 UTC);
        let not_after = datetime!(2017-08-24 19:00:40 UTC);
        let (cert_pem, _) = cert_between(not_before, not_after);

        let now = datetime!(2017-08-25 21:00:00 UTC);
        let err = get_wait_time(cert_pem.as_bytes(), now, 50).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("certificate already expired at"));
    }

    #[test]
    fn test_verify_chain_self_signed() {
        let now = OffsetDateTime::now_utc();
        let options = CertOptions {
            not_before: now,
            not_after: now + ::time::Duration::hours(1),
            org: "test.org".to_string(),
            is_ca: true,
            is_self_signed: true,
            rsa_key_size: 2048,
            ..Default::default()
        };
        let (ca_pem, _) = gen_cert(&options).unwrap();
        verify_cert_chain(ca_pem.as_bytes(), &[], ca_pem.as_bytes()).unwrap();
    }

    #[test]
    fn test_verify_chain_with_intermediate() {
        let now = OffsetDateTime::now_utc();
        let (root_pem, root_key_pem) = gen_cert(&CertOptions {
            not_before: now,
            not_after: now + ::time::Duration::hours(2),
            org: "test.org".to_string(),
            is_ca: true,
            is_self_signed: true,
            rsa_key_size: 2048,
            ..Default::default()
        })
        .unwrap();

        let root_cert = parse_pem_encoded_certificate(root_pem.as_bytes()).unwrap();
        let root_key = match parse_pem_encoded_key(root_key_pem.as_bytes()).unwrap() {
            PrivateKey::Rsa(key) => key,
            _ => panic!("expected an RSA key"),
        };

        let (intermediate_pem, intermediate_key_pem) = gen_cert(&CertOptions {
            not_before: now,
            not_after: now + ::time::Duration::hours(1),
            signer_cert: Some(root_cert),
            signer_key: Some(root_key),
            org: "test.org intermediate".to_string(),
            is_ca: true,
            rsa_key_size: 2048,
            ..Default::default()
        })
        .unwrap();

        let intermediate_cert =
            parse_pem_encoded_certificate(intermediate_pem.as_bytes()).unwrap();
        let intermediate_key =
            match parse_pem_encoded_key(intermediate_key_pem.as_bytes()).unwrap() {
                PrivateKey::Rsa(key) => key,
                _ => panic!("expected an RSA key"),
            };

        let (leaf_pem, _) = gen_cert(&CertOptions {
            host: "workload.example.com".to_string(),
            not_before: now,
            not_after: now + ::time::Duration::minutes(10),
            signer_cert: Some(intermediate_cert),
            signer_key: Some(intermediate_key),
            org: "test.org".to_string(),
            is_client: true,
            is_server: true,
            rsa_key_size: 1024,
            ..Default::default()
        })
        .unwrap();

        // The leaf reaches the root through the intermediate.
        verify_cert_chain(
            leaf_pem.as_bytes(),
            intermediate_pem.as_bytes(),
            root_pem.as_bytes(),
        )
        .unwrap();

        // Without the intermediate the walk must fail.
        assert!(verify_cert_chain(leaf_pem.as_bytes(), &[], root_pem.as_bytes()).is_err());
    }

    #[test]
    fn test_verify_chain_unrelated_root() {
        let now = OffsetDateTime::now_utc();
        let options = CertOptions {
            not_before: now,
            not_after: now + ::time::Duration::hours(1),
            org: "test.org".to_string(),
            is_ca: true,
            is_self_signed: true,
            rsa_key_size: 2048,
            ..Default::default()
        };
        let (ca_pem, _) = gen_cert(&options).unwrap();
        let (other_pem, _) = gen_cert(&options).unwrap();
        assert!(verify_cert_chain(ca_pem.as_bytes(), &[], other_pem.as_bytes()).is_err());
    }
}
