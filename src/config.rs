use serde::{Deserialize, Serialize};

use crate::descriptor::DescriptorLayout;
use crate::HbstError;

/// Configuration of a [`crate::BinaryMatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Descriptor width in bits (128, 256, 488, 512, ...).
    pub descriptor_bits: usize,
    /// Worker threads used to match a batch; 1 matches on the calling thread.
    pub worker_count: usize,
    /// Accept rows narrower than the descriptor width and zero-pad them.
    pub pad_allowed: bool,
    /// Default maximum Hamming distance for a reported match.
    pub max_distance: u32,
    /// Use early-exit matching by default.
    pub lazy: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            descriptor_bits: 256,
            worker_count: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            pad_allowed: false,
            max_distance: 25,
            lazy: false,
        }
    }
}

impl MatcherConfig {
    /// Default configuration for descriptors of `descriptor_bits` bits.
    pub fn new(descriptor_bits: usize) -> Self {
        Self {
            descriptor_bits,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_padding(mut self, pad_allowed: bool) -> Self {
        self.pad_allowed = pad_allowed;
        self
    }

    pub fn with_max_distance(mut self, max_distance: u32) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub fn validate(&self) -> Result<(), HbstError> {
        if self.descriptor_bits == 0 {
            return Err(HbstError::InvalidConfig(
                "descriptor_bits must be positive",
            ));
        }
        if self.worker_count == 0 {
            return Err(HbstError::InvalidConfig(
                "worker_count must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<DescriptorLayout, HbstError> {
        DescriptorLayout::new(self.descriptor_bits)
    }
}
