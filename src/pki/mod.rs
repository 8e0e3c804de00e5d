pub mod ca;
pub mod certificate;
pub mod validator;

pub use certificate::{gen_cert, gen_csr, CertOptions};
pub use validator::{
    extract_spiffe_uri, get_wait_time, parse_pem_encoded_certificate, parse_pem_encoded_key,
    verify_cert_chain, PrivateKey,
};

use anyhow::{bail, Result};

/// URI scheme for workload identities.
pub const URI_SCHEME: &str = "spiffe";

/// Trust domain used when none is configured.
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Format the identity URI for a service account in a namespace.
pub fn spiffe_identity(trust_domain: &str, namespace: &str, service_account: &str) -> String {
    format!("{URI_SCHEME}://{trust_domain}/ns/{namespace}/sa/{service_account}")
}

/// Split an identity URI of the form `spiffe://<td>/ns/<namespace>/sa/<account>`
/// into its service account and namespace.
pub fn parse_spiffe_identity(identity: &str) -> Result<(String, String)> {
    let rest = match identity.strip_prefix(&format!("{URI_SCHEME}://")) {
        Some(rest) => rest,
        None => bail!("not a {URI_SCHEME} identity: {identity}"),
    };

    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        [_td, "ns", namespace, "sa", account] if !namespace.is_empty() && !account.is_empty() => {
            Ok((account.to_string(), namespace.to_string()))
        }
        _ => bail!("malformed workload identity: {identity}"),
    }
}
