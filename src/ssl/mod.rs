#![allow(dead_code)]

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::proxy::service::ServiceOptions;

/// On-demand certificate management for a TLS service. Holds the host
/// policy and the scoped certificate cache location; the ACME protocol
/// client that fills the cache is wired in by the TLS listener.
#[derive(Debug, Clone)]
pub struct CertManager {
    hostname: String,
    directory_url: String,
    cache_dir: PathBuf,
}

impl CertManager {
    /// Returns None unless the service requires TLS.
    pub fn new(options: &ServiceOptions) -> Option<Self> {
        if !options.require_tls() {
            return None;
        }

        Some(Self {
            hostname: options.tls_hostname.clone(),
            directory_url: options.acme_directory.clone(),
            cache_dir: scoped_cache_path(&options.acme_cache_path, &options.acme_directory),
        })
    }

    /// Certificates are only issued for exactly the configured hostname.
    pub fn allows_host(&self, host: &str) -> bool {
        self.hostname.eq_ignore_ascii_case(host)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub async fn ensure_cache_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await
    }
}

// The certificate cache is scoped by the ACME settings in use, such as the
// directory. Deployments with the same settings reuse certificates, while a
// change of directory (say, staging to production) provisions fresh ones.
fn scoped_cache_path(base: &str, directory_url: &str) -> PathBuf {
    let hash = Sha256::digest(directory_url.as_bytes());
    let hex: String = hash.iter().map(|byte| format!("{:02x}", byte)).collect();
    Path::new(base).join(hex)
}
