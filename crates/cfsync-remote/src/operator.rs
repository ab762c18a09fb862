//! OpenDAL Operator factory for cfsync remote backends

use anyhow::{Context, Result};
use cfsync_core::config::{expand_tilde, RemoteConfig};
use cfsync_core::RemoteKind;
use opendal::Operator;
use secrecy::{ExposeSecret, SecretString};

/// S3 credentials resolved from the environment.
pub struct S3Credentials {
    pub access_key_id: SecretString,
    pub secret_access_key: SecretString,
}

impl S3Credentials {
    pub fn from_env(cfg: &RemoteConfig) -> Result<Self> {
        let access = std::env::var(&cfg.access_key_env)
            .with_context(|| format!("reading S3 access key from ${}", cfg.access_key_env))?;
        let secret = std::env::var(&cfg.secret_key_env)
            .with_context(|| format!("reading S3 secret key from ${}", cfg.secret_key_env))?;
        Ok(Self {
            access_key_id: SecretString::from(access),
            secret_access_key: SecretString::from(secret),
        })
    }
}

/// Build an OpenDAL Operator for an SFTP server (key-based login).
pub fn build_sftp_operator(cfg: &RemoteConfig) -> Result<Operator> {
    let mut builder = opendal::services::Sftp::default()
        .endpoint(&format!("ssh://{}:{}", cfg.host, cfg.port))
        .root(&cfg.root);
    if !cfg.user.is_empty() {
        builder = builder.user(&cfg.user);
    }
    if let Some(key) = &cfg.key_path {
        builder = builder.key(&expand_tilde(key).to_string_lossy());
    }

    let op = Operator::new(builder)
        .context("creating OpenDAL SFTP operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build an OpenDAL Operator for any S3-compatible endpoint.
///
/// Uses path-style addressing (default in opendal 0.55), which MinIO and
/// SeaweedFS require.
pub fn build_s3_operator(cfg: &RemoteConfig, creds: &S3Credentials) -> Result<Operator> {
    if cfg.endpoint.starts_with("http://") {
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP, credentials are transmitted unencrypted"
        );
    }

    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .root(&cfg.root)
        .access_key_id(creds.access_key_id.expose_secret())
        .secret_access_key(creds.secret_access_key.expose_secret());

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build the operator a remote config asks for. `Memory` has no operator:
/// it is served by [`MemoryRemote`](crate::MemoryRemote) directly.
pub fn build_operator(cfg: &RemoteConfig) -> Result<Operator> {
    match cfg.kind {
        RemoteKind::Sftp => build_sftp_operator(cfg),
        RemoteKind::S3 => build_s3_operator(cfg, &S3Credentials::from_env(cfg)?),
        RemoteKind::Memory => anyhow::bail!("the memory remote is not backed by an operator"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_s3_operator_valid() {
        let cfg = RemoteConfig {
            kind: RemoteKind::S3,
            endpoint: "http://localhost:9000".into(),
            bucket: "test-bucket".into(),
            ..Default::default()
        };
        let creds = S3Credentials {
            access_key_id: SecretString::from("test-key".to_string()),
            secret_access_key: SecretString::from("test-secret".to_string()),
        };
        let op = build_s3_operator(&cfg, &creds);
        assert!(op.is_ok(), "operator construction should succeed");
    }

    #[test]
    fn test_s3_credentials_missing_env() {
        let cfg = RemoteConfig {
            kind: RemoteKind::S3,
            access_key_env: "CFSYNC_TEST_DEFINITELY_UNSET_KEY".into(),
            ..Default::default()
        };
        let err = build_operator(&cfg).unwrap_err();
        assert!(err.to_string().contains("CFSYNC_TEST_DEFINITELY_UNSET_KEY"));
    }

    #[test]
    fn test_memory_kind_has_no_operator() {
        let cfg = RemoteConfig {
            kind: RemoteKind::Memory,
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_err());
    }
}
