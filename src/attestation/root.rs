use std::io::{Cursor, Read};

use openssl::x509::X509;
use tokio::sync::OnceCell;

use crate::error::{AttestError, Error};
use crate::transport::http;

/// Well-known location of the AWS Nitro Enclaves root certificate archive.
pub const AWS_NITRO_ROOT_URL: &str =
    "https://aws-nitro-enclaves.amazonaws.com/AWS_NitroEnclaves_Root-G1.zip";

/// Name of the certificate file inside the root archive.
const ROOT_PEM_ENTRY: &str = "root.pem";

/// Where the pinned root certificate comes from.
#[derive(Debug, Clone)]
pub enum RootOfTrust {
    /// Root supplied out-of-band by the operator.
    Pinned(X509),
    /// Root fetched once from a ZIP archive at `url`.
    Remote { url: String },
}

impl Default for RootOfTrust {
    fn default() -> Self {
        Self::Remote {
            url: AWS_NITRO_ROOT_URL.to_string(),
        }
    }
}

impl RootOfTrust {
    /// Pin a root from PEM bytes.
    pub fn from_pem(pem: &[u8]) -> Result<Self, AttestError> {
        X509::from_pem(pem)
            .map(Self::Pinned)
            .map_err(|e| AttestError::RootCertificate(format!("failed to parse root CA PEM: {e}")))
    }

    /// Pin a root from DER bytes.
    pub fn from_der(der: &[u8]) -> Result<Self, AttestError> {
        X509::from_der(der)
            .map(Self::Pinned)
            .map_err(|e| AttestError::RootCertificate(format!("failed to parse root CA DER: {e}")))
    }
}

/// Resolves a [`RootOfTrust`] to a certificate, fetching at most once.
#[derive(Debug)]
pub(crate) struct RootResolver {
    source: RootOfTrust,
    resolved: OnceCell<X509>,
}

impl RootResolver {
    pub(crate) fn new(source: RootOfTrust) -> Self {
        let resolved = match &source {
            RootOfTrust::Pinned(cert) => OnceCell::new_with(Some(cert.clone())),
            RootOfTrust::Remote { .. } => OnceCell::new(),
        };
        Self { source, resolved }
    }

    pub(crate) async fn get(&self) -> Result<&X509, Error> {
        self.resolved
            .get_or_try_init(|| async {
                match &self.source {
                    RootOfTrust::Pinned(cert) => Ok(cert.clone()),
                    RootOfTrust::Remote { url } => fetch_root(url).await,
                }
            })
            .await
    }
}

async fn fetch_root(url: &str) -> Result<X509, Error> {
    tracing::debug!(%url, "fetching attestation root certificate");
    let archive = http::get_bytes(url).await?;
    let pem = extract_root_pem(&archive)?;
    let cert = X509::from_pem(&pem)
        .map_err(|e| AttestError::RootCertificate(format!("failed to parse {ROOT_PEM_ENTRY}: {e}")))?;
    tracing::info!(%url, "attestation root certificate loaded");
    Ok(cert)
}

/// Pull `root.pem` out of the vendor's ZIP archive.
pub(crate) fn extract_root_pem(archive: &[u8]) -> Result<Vec<u8>, AttestError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| AttestError::RootCertificate(format!("invalid root archive: {e}")))?;
    let mut entry = zip
        .by_name(ROOT_PEM_ENTRY)
        .map_err(|e| AttestError::RootCertificate(format!("{ROOT_PEM_ENTRY}: {e}")))?;
    let mut pem = Vec::new();
    entry
        .read_to_end(&mut pem)
        .map_err(|e| AttestError::RootCertificate(format!("{ROOT_PEM_ENTRY}: {e}")))?;
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn zip_with(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file(name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn extracts_root_pem_entry() {
        let archive = zip_with("root.pem", b"-----BEGIN CERTIFICATE-----");
        let pem = extract_root_pem(&archive).unwrap();
        assert_eq!(pem, b"-----BEGIN CERTIFICATE-----");
    }

    #[test]
    fn archive_without_root_pem_is_rejected() {
        let archive = zip_with("other.pem", b"x");
        let err = extract_root_pem(&archive).unwrap_err();
        assert!(err.to_string().contains("root.pem"), "{err}");
    }

    #[test]
    fn garbage_archive_is_rejected() {
        assert!(extract_root_pem(b"not a zip").is_err());
    }

    #[tokio::test]
    async fn pinned_root_resolves_without_network() {
        let pem = crate::attestation::nitro::test_support::generate_test_ca()
            .1
            .to_pem()
            .unwrap();
        let resolver = RootResolver::new(RootOfTrust::from_pem(&pem).unwrap());
        let cert = resolver.get().await.unwrap();
        assert_eq!(cert.to_pem().unwrap(), pem);
    }
}
