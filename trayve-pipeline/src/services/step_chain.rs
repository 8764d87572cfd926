//! Step chain policy
//!
//! Maps a subscription tier to the ordered steps run for every pose and the
//! quality requested from the try-on provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{Quality, StepType, Tier};

/// Ordered steps and quality for one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepChain {
    pub steps: Vec<StepType>,
    pub quality: Quality,
}

impl StepChain {
    /// Built-in chain for a tier
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            steps: steps_for_tier(tier),
            quality: quality_for_tier(tier),
        }
    }

    pub fn upscale_factor(&self) -> u32 {
        self.quality.upscale_factor()
    }

    /// Force try-on to the front and drop duplicate steps
    fn normalized(mut self) -> Self {
        let mut seen = Vec::with_capacity(self.steps.len() + 1);
        seen.push(StepType::TryOn);
        for step in self.steps.drain(..) {
            if !seen.contains(&step) {
                seen.push(step);
            }
        }
        self.steps = seen;
        self
    }
}

pub fn steps_for_tier(tier: Tier) -> Vec<StepType> {
    match tier {
        Tier::Free => vec![StepType::TryOn, StepType::Watermark],
        Tier::Creator | Tier::Starter => vec![StepType::TryOn],
        Tier::Professional | Tier::Enterprise => vec![
            StepType::TryOn,
            StepType::EnhancedUpscale,
            StepType::FaceRefine,
        ],
    }
}

pub fn quality_for_tier(tier: Tier) -> Quality {
    match tier {
        Tier::Free => Quality::Standard,
        Tier::Creator | Tier::Starter => Quality::High,
        Tier::Professional | Tier::Enterprise => Quality::Premium,
    }
}

/// Tier table with optional per-tier overrides from configuration
#[derive(Debug, Clone, Default)]
pub struct StepChainPolicy {
    overrides: HashMap<Tier, StepChain>,
}

impl StepChainPolicy {
    pub fn new(overrides: HashMap<Tier, StepChain>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(tier, chain)| (tier, chain.normalized()))
            .collect();
        Self { overrides }
    }

    /// Resolve the chain for a tier; try-on is always the first step
    pub fn resolve(&self, tier: Tier) -> StepChain {
        self.overrides
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| StepChain::for_tier(tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TIERS: [Tier; 5] = [
        Tier::Free,
        Tier::Creator,
        Tier::Starter,
        Tier::Professional,
        Tier::Enterprise,
    ];

    #[test]
    fn test_every_tier_starts_with_try_on() {
        let policy = StepChainPolicy::default();
        for tier in ALL_TIERS {
            assert_eq!(policy.resolve(tier).steps[0], StepType::TryOn, "{}", tier);
        }
    }

    #[test]
    fn test_default_table() {
        let free = StepChain::for_tier(Tier::Free);
        assert_eq!(free.steps, vec![StepType::TryOn, StepType::Watermark]);
        assert_eq!(free.quality, Quality::Standard);

        let starter = StepChain::for_tier(Tier::Starter);
        assert_eq!(starter.steps, vec![StepType::TryOn]);
        assert_eq!(starter.quality, Quality::High);
        assert_eq!(StepChain::for_tier(Tier::Creator), starter);

        let pro = StepChain::for_tier(Tier::Professional);
        assert_eq!(
            pro.steps,
            vec![
                StepType::TryOn,
                StepType::EnhancedUpscale,
                StepType::FaceRefine
            ]
        );
        assert_eq!(pro.quality, Quality::Premium);
        assert_eq!(pro.upscale_factor(), 4);
        assert_eq!(StepChain::for_tier(Tier::Enterprise), pro);
    }

    #[test]
    fn test_override_is_normalized() {
        let mut overrides = HashMap::new();
        overrides.insert(
            Tier::Starter,
            StepChain {
                steps: vec![StepType::EnhancedUpscale, StepType::TryOn, StepType::EnhancedUpscale],
                quality: Quality::Premium,
            },
        );
        let policy = StepChainPolicy::new(overrides);

        let chain = policy.resolve(Tier::Starter);
        assert_eq!(chain.steps, vec![StepType::TryOn, StepType::EnhancedUpscale]);
        assert_eq!(chain.quality, Quality::Premium);

        // Tiers without an override keep the built-in chain
        assert_eq!(policy.resolve(Tier::Free), StepChain::for_tier(Tier::Free));
    }
}
