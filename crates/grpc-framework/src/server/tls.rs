use crate::config::{ServerConfig, TlsConfig};
use crate::error::{Error, Result};
use std::path::Path;
use tonic::transport::{Identity, ServerTlsConfig};

/// Loads the server's TLS identity.
///
/// Returns `None` when no TLS material is configured or the transport is
/// local. Unreadable files are fatal; there is no plaintext fallback.
pub async fn load(config: &ServerConfig) -> Result<Option<ServerTlsConfig>> {
    let Some(tls) = config.tls() else {
        tracing::info!("TLS disabled");
        return Ok(None);
    };
    if config.transport().is_local() {
        tracing::info!(transport = %config.transport(), "TLS skipped for local transport");
        return Ok(None);
    }

    let identity = read_identity(tls).await?;
    tracing::info!(cert = %tls.cert_file.display(), "TLS enabled");
    Ok(Some(ServerTlsConfig::new().identity(identity)))
}

async fn read_identity(tls: &TlsConfig) -> Result<Identity> {
    let cert = read(&tls.cert_file).await?;
    let key = read(&tls.key_file).await?;
    Ok(Identity::from_pem(cert, key))
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|source| Error::CredentialLoad {
            path: path.to_path_buf(),
            source,
        })
}
