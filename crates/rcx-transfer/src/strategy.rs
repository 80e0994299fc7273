//! Destination strategy selection
//!
//! Decided once when a download starts; never re-evaluated mid-transfer.

use rcx_core::config::StrategyConfig;
use rcx_core::types::DestinationStrategy;
use rcx_core::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
    VeryLarge,
    TooLarge,
}

impl SizeCategory {
    pub fn classify(size: u64, cfg: &StrategyConfig) -> Self {
        if size <= cfg.large_file_warning {
            Self::Small
        } else if size <= cfg.streaming_recommended {
            Self::Medium
        } else if size <= cfg.max_safe_inmemory {
            Self::Large
        } else if size <= cfg.max_downloadable {
            Self::VeryLarge
        } else {
            Self::TooLarge
        }
    }
}

/// What the host can offer besides an in-memory buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub streaming: bool,
    pub proxy: bool,
}

pub fn select_strategy(
    file_size: Option<u64>,
    caps: Capabilities,
    cfg: &StrategyConfig,
) -> Result<DestinationStrategy, TransferError> {
    use DestinationStrategy::{InMemory, Proxy, Streaming};

    let Some(size) = file_size else {
        return Ok(if caps.streaming { Streaming } else { InMemory });
    };
    let category = SizeCategory::classify(size, cfg);
    if category != SizeCategory::Small {
        tracing::warn!(size, ?category, "large download");
    }
    match category {
        SizeCategory::Small | SizeCategory::Medium => Ok(InMemory),
        SizeCategory::Large if caps.streaming => Ok(Streaming),
        SizeCategory::Large => Ok(InMemory),
        SizeCategory::VeryLarge if caps.streaming => Ok(Streaming),
        SizeCategory::VeryLarge | SizeCategory::TooLarge if caps.proxy => Ok(Proxy),
        SizeCategory::VeryLarge => Err(TransferError::Refused(format!(
            "{size} bytes exceeds the in-memory limit of {} bytes and no streaming destination is available",
            cfg.max_safe_inmemory
        ))),
        SizeCategory::TooLarge => Err(TransferError::Refused(format!(
            "{size} bytes exceeds the download limit of {} bytes",
            cfg.max_downloadable
        ))),
    }
}
