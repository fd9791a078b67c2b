//! Protocol version resolution. Failure here must never fail a connect
//! attempt: the last known good version is used instead.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

/// Last known good protocol version, used whenever resolution fails.
pub const FALLBACK_VERSION: (u32, u32, u32) = (2, 3000, 1023223821);

/// Fetches the current protocol version from wherever the deployment gets it
/// (an HTTP endpoint, a pinned file, ...).
#[async_trait]
pub trait VersionProvider: Send + Sync {
    async fn fetch_latest(&self) -> Result<(u32, u32, u32), anyhow::Error>;
}

/// Resolve the version to advertise. An override short-circuits everything;
/// provider errors fall back rather than propagate.
pub async fn resolve(
    provider: Option<&Arc<dyn VersionProvider>>,
    override_version: Option<(u32, u32, u32)>,
) -> (u32, u32, u32) {
    if let Some(version) = override_version {
        debug!(target: "Wbot/Version", "using override version {version:?}");
        return version;
    }
    match provider {
        Some(provider) => match provider.fetch_latest().await {
            Ok(version) => {
                debug!(target: "Wbot/Version", "resolved version {version:?}");
                version
            }
            Err(e) => {
                warn!(
                    target: "Wbot/Version",
                    "version fetch failed, falling back to {FALLBACK_VERSION:?}: {e}"
                );
                FALLBACK_VERSION
            }
        },
        None => FALLBACK_VERSION,
    }
}
