//! Remote health check

use anyhow::Result;

use crate::remote::RemoteRead;

/// Verify the remote is reachable by listing its root
pub async fn check_health(remote: &dyn RemoteRead) -> Result<()> {
    // Listing the root is the lightest call every backend supports
    remote
        .try_enumerate("", "*")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("remote health check failed: {e:#}"))
}

/// Returns true if the remote is reachable, false otherwise (non-panicking)
pub async fn is_healthy(remote: &dyn RemoteRead) -> bool {
    check_health(remote).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;

    #[tokio::test]
    async fn reports_unreachable_remote() {
        let remote = MemoryRemote::new();
        assert!(is_healthy(&remote).await);
        remote.set_unreachable(true);
        let err = check_health(&remote).await.unwrap_err();
        assert!(err.to_string().contains("health check failed"));
    }
}
