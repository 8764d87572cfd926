//! Subscription tiers, output quality levels and pipeline step identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Merchant subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Creator,
    Starter,
    Professional,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Creator => "creator",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "creator" => Ok(Tier::Creator),
            "starter" => Ok(Tier::Starter),
            "professional" => Ok(Tier::Professional),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("Unknown tier: {}", other)),
        }
    }
}

/// Output quality requested from the try-on provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Standard,
    High,
    Premium,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Standard => "standard",
            Quality::High => "high",
            Quality::Premium => "premium",
        }
    }

    /// Upscale factor used when the chain contains an upscale step
    pub fn upscale_factor(&self) -> u32 {
        match self {
            Quality::Standard | Quality::High => 2,
            Quality::Premium => 4,
        }
    }
}

/// One step of the generation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    /// Virtual try-on composite (always first, fatal on failure)
    TryOn,
    /// Free-tier watermark
    Watermark,
    /// Resolution upscale
    EnhancedUpscale,
    /// Face consistency refinement against the model reference
    FaceRefine,
}

impl StepType {
    /// Key used in `step_results` and artifact paths
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::TryOn => "try-on",
            StepType::Watermark => "watermark",
            StepType::EnhancedUpscale => "enhanced-upscale",
            StepType::FaceRefine => "face-refine",
        }
    }

    /// Whether a failure of this step fails the whole pose
    ///
    /// Only try-on is fatal: later steps have an earlier artifact to fall back to.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepType::TryOn)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "try-on" => Ok(StepType::TryOn),
            "watermark" => Ok(StepType::Watermark),
            "enhanced-upscale" => Ok(StepType::EnhancedUpscale),
            "face-refine" => Ok(StepType::FaceRefine),
            other => Err(format!("Unknown step type: {}", other)),
        }
    }
}
