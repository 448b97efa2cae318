//! Reuse of completed release extension work.

use tracing::debug;

use berth_state::{ReleaseExtension, ReleaseStore};

use crate::error::Result;

/// Outcome of a cache lookup for one release extension.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// Dispatch fresh work.
    Miss,
    /// Reuse the given completed release extension.
    Hit(ReleaseExtension),
}

/// Message recorded on a release extension resolved from `previous`.
pub fn cached_message(previous: &ReleaseExtension) -> String {
    format!(
        "Using cache from previous release: {}",
        previous.state_message
    )
}

/// Look for the most recent completed release extension with the same
/// project extension, feature hash and signatures as `candidate`.
///
/// Never reuses when the release forces a rebuild or the extension is not
/// cacheable.
pub async fn resolve_cache<S>(
    store: &S,
    candidate: &ReleaseExtension,
    force_rebuild: bool,
    cacheable: bool,
) -> Result<CacheDecision>
where
    S: ReleaseStore + ?Sized,
{
    if force_rebuild || !cacheable {
        return Ok(CacheDecision::Miss);
    }

    let key = candidate.cache_key();
    match store.find_cached_release_extension(&key).await? {
        Some(previous) if previous.id != candidate.id => {
            debug!(
                release_extension_id = %candidate.id,
                cached_from = %previous.id,
                "cache hit"
            );
            Ok(CacheDecision::Hit(previous))
        }
        _ => Ok(CacheDecision::Miss),
    }
}
