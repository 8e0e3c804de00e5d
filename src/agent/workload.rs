use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// File mode for the service identity private key.
const KEY_FILE_PERMISSION: u32 = 0o600;

/// File mode for the service identity certificate chain.
const CERT_FILE_PERMISSION: u32 = 0o644;

/// Surfaces the issued identity to the workload through files on disk.
pub struct SecretFile {
    service_identity_cert_file: PathBuf,
    service_identity_key_file: PathBuf,
}

impl SecretFile {
    pub fn new(service_identity_cert_file: PathBuf, service_identity_key_file: PathBuf) -> Self {
        Self {
            service_identity_cert_file,
            service_identity_key_file,
        }
    }

    pub fn set_service_identity_key(&self, content: &[u8]) -> Result<()> {
        write_with_mode(&self.service_identity_key_file, content, KEY_FILE_PERMISSION)
            .context("cannot write service identity private key file")
    }

    pub fn set_service_identity_cert(&self, content: &[u8]) -> Result<()> {
        write_with_mode(
            &self.service_identity_cert_file,
            content,
            CERT_FILE_PERMISSION,
        )
        .context("cannot write service identity certificate file")
    }
}

fn write_with_mode(path: &Path, content: &[u8], mode: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(content)
}
