use cache_advisor::CacheAdvisor;

use crate::{BlockId, Config};

/// Chooses which resident blocks to evict.
///
/// The cache reports every access along with the block's size, and the
/// policy answers with the blocks it would like gone. A suggested victim is
/// only unloaded if it is safe to do so at that moment: no live handles, no
/// waiters on its lock, nothing dirty, and no snapshot still pinned by a live
/// transaction. Victims that are not safe stay resident and will be reported
/// again on their next access.
pub trait PageReplacementPolicy: Send {
    /// Record an access to `block_id` and return eviction candidates.
    fn accessed(&mut self, block_id: BlockId, size: usize) -> Vec<BlockId>;

    /// `block_id` left the cache for a reason other than eviction.
    fn forget(&mut self, block_id: BlockId) {
        let _ = block_id;
    }
}

/// The default policy: a scan-resistant cache advisor sized by
/// `Config::cache_capacity_bytes` and `Config::entry_cache_percent`.
pub struct AdvisorPolicy {
    advisor: CacheAdvisor,
}

impl AdvisorPolicy {
    /// A policy sized from `config`.
    pub fn new(config: &Config) -> AdvisorPolicy {
        if config.entry_cache_percent > 80 {
            log::debug!(
                "Config.entry_cache_percent is over 80%, so \
                 we will clamp it to the maximum of 80% instead"
            );
        }

        AdvisorPolicy {
            advisor: CacheAdvisor::new(
                config.cache_capacity_bytes.max(256),
                config.entry_cache_percent.min(80),
            ),
        }
    }
}

impl std::fmt::Debug for AdvisorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisorPolicy").finish_non_exhaustive()
    }
}

impl PageReplacementPolicy for AdvisorPolicy {
    fn accessed(&mut self, block_id: BlockId, size: usize) -> Vec<BlockId> {
        self.advisor
            .accessed_reuse_buffer(block_id, size)
            .iter()
            .map(|(victim, _rough_size)| *victim)
            .filter(|victim| *victim != block_id)
            .collect()
    }
}
