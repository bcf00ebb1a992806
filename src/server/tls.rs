//! Certificate loading for the secure listener.

use std::fs;
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tracing::{debug, info};

use crate::config::TlsFiles;
use crate::error::ServerError;

/// Names the generated certificate is valid for
const SELF_SIGNED_NAMES: &[&str] = &["localhost", "127.0.0.1"];

/// Make sure the certificate pair exists, generating a self-signed one
/// when allowed, then load it.
pub fn prepare(files: &TlsFiles) -> Result<Arc<ServerConfig>, ServerError> {
    if files.generate && (!files.cert.exists() || !files.key.exists()) {
        provision_self_signed(&files.cert, &files.key)?;
    }
    load_server_config(&files.cert, &files.key)
}

/// Read a PEM certificate chain and private key into a rustls config.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, ServerError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::certificate(cert_path, format!("rejected by TLS stack: {}", e)))?;

    debug!("TLS config loaded from {}", cert_path.display());
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = fs::File::open(path).map_err(|e| ServerError::certificate(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::certificate(path, format!("unparsable PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(ServerError::certificate(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = fs::File::open(path).map_err(|e| ServerError::certificate(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ServerError::certificate(path, format!("unparsable PEM: {}", e)))?
        .ok_or_else(|| ServerError::certificate(path, "no private key found"))
}

/// Write a self-signed certificate and key for local use.
pub fn provision_self_signed(cert_path: &Path, key_path: &Path) -> Result<(), ServerError> {
    let names = SELF_SIGNED_NAMES.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let generated = rcgen::generate_simple_self_signed(names)
        .map_err(|e| ServerError::certificate(cert_path, format!("generation failed: {}", e)))?;

    for path in [cert_path, key_path] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| ServerError::certificate(path, e))?;
        }
    }

    fs::write(cert_path, generated.cert.pem()).map_err(|e| ServerError::certificate(cert_path, e))?;
    write_private(key_path, generated.key_pair.serialize_pem().as_bytes())
        .map_err(|e| ServerError::certificate(key_path, e))?;

    info!(
        "🔐 Generated self-signed certificate {} (key {})",
        cert_path.display(),
        key_path.display()
    );
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_certificate_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_server_config(&dir.path().join("none.crt"), &dir.path().join("none.key")).unwrap_err();
        assert!(matches!(err, ServerError::Certificate { .. }));
        assert!(err.to_string().contains("none.crt"));
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("bad.crt");
        let key = dir.path().join("bad.key");
        fs::write(&cert, "not a certificate").unwrap();
        fs::write(&key, "not a key").unwrap();

        let err = load_server_config(&cert, &key).unwrap_err();
        assert!(matches!(err, ServerError::Certificate { .. }));
    }

    #[test]
    fn test_provision_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let files = TlsFiles {
            cert: dir.path().join("certs/virtual_camera.crt"),
            key: dir.path().join("certs/virtual_camera.key"),
            generate: true,
        };

        prepare(&files).unwrap();
        assert!(files.cert.exists());
        assert!(files.key.exists());

        // Existing files are reused, not regenerated
        let before = fs::read(&files.cert).unwrap();
        prepare(&files).unwrap();
        assert_eq!(before, fs::read(&files.cert).unwrap());
    }

    #[test]
    fn test_no_generation_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let files = TlsFiles {
            cert: dir.path().join("a.crt"),
            key: dir.path().join("a.key"),
            generate: false,
        };
        assert!(prepare(&files).is_err());
        assert!(!files.cert.exists());
    }
}
