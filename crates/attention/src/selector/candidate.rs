use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::core::{AttentionConfig, DeviceKind};
use crate::layout::{CacheMode, Precision, ResolvedLayout};

/// Largest head size the fused cross-attention kernel handles.
pub const FUSED_CROSS_MAX_HEAD_SIZE: usize = 64;
/// Largest head size the fused self-attention kernel handles.
pub const FUSED_SELF_MAX_HEAD_SIZE: usize = 128;
/// Longest sequence the fused self-attention kernel handles.
pub const FUSED_SELF_MAX_SEQ_LEN: usize = 512;
pub const MEMORY_EFFICIENT_MAX_HEAD_SIZE: usize = 1024;
pub const FLASH_MAX_HEAD_SIZE: usize = 256;

/// Identity of a compute kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelCandidate {
    /// Automatic selection; never executed itself.
    #[default]
    Default,
    Unfused,
    FusedSelf,
    FusedCross,
    MemoryEfficient,
    FlashAttention,
}

impl KernelCandidate {
    /// Selection order; the first applicable candidate wins.
    pub const PRIORITY: [KernelCandidate; 5] = [
        KernelCandidate::FusedCross,
        KernelCandidate::FusedSelf,
        KernelCandidate::MemoryEfficient,
        KernelCandidate::FlashAttention,
        KernelCandidate::Unfused,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KernelCandidate::Default => "default",
            KernelCandidate::Unfused => "unfused",
            KernelCandidate::FusedSelf => "fused_self",
            KernelCandidate::FusedCross => "fused_cross",
            KernelCandidate::MemoryEfficient => "memory_efficient",
            KernelCandidate::FlashAttention => "flash_attention",
        }
    }

    /// Static applicability predicate, independent of toggles and backends.
    ///
    /// Returns the first violated condition.
    pub fn admits(self, ctx: &SelectionContext) -> Result<(), String> {
        match self {
            KernelCandidate::Default => Err("automatic selection is not a kernel".to_string()),
            KernelCandidate::Unfused => Ok(()),
            KernelCandidate::FusedCross => {
                require(ctx.is_cross_attention, "requires cross attention")?;
                require(ctx.precision == Precision::Half, "requires half precision")?;
                require(
                    ctx.head_size == ctx.v_head_size
                        && ctx.head_size <= FUSED_CROSS_MAX_HEAD_SIZE,
                    "head size out of range",
                )?;
                require(ctx.mask == MaskKind::None, "mask not supported")?;
                require(!ctx.has_attention_bias, "attention bias not supported")?;
                require(!ctx.unidirectional, "causal attention not supported")?;
                require(!ctx.output_qk, "cannot emit attention scores")
            }
            KernelCandidate::FusedSelf => {
                require(!ctx.is_cross_attention, "requires self attention")?;
                require(ctx.cache_mode == CacheMode::NoCache, "past key/value not supported")?;
                require(ctx.precision == Precision::Half, "requires half precision")?;
                require(!ctx.has_attention_bias, "attention bias not supported")?;
                require(
                    matches!(ctx.mask, MaskKind::None | MaskKind::KeyLengths),
                    "only key-length masks are supported",
                )?;
                require(
                    ctx.head_size == ctx.v_head_size
                        && ctx.head_size <= FUSED_SELF_MAX_HEAD_SIZE,
                    "head size out of range",
                )?;
                require(
                    ctx.sequence_length <= FUSED_SELF_MAX_SEQ_LEN,
                    "sequence too long",
                )?;
                require(!ctx.output_qk, "cannot emit attention scores")
            }
            KernelCandidate::MemoryEfficient => {
                require(
                    ctx.head_size % 8 == 0
                        && ctx.v_head_size % 8 == 0
                        && ctx.head_size <= MEMORY_EFFICIENT_MAX_HEAD_SIZE
                        && ctx.v_head_size <= MEMORY_EFFICIENT_MAX_HEAD_SIZE,
                    "head size must be a multiple of 8 up to 1024",
                )?;
                require(ctx.mask != MaskKind::RawIndex, "raw index mask not supported")?;
                require(!ctx.output_qk, "cannot emit attention scores")
            }
            KernelCandidate::FlashAttention => {
                require(ctx.precision == Precision::Half, "requires half precision")?;
                require(
                    ctx.head_size == ctx.v_head_size
                        && ctx.head_size % 8 == 0
                        && ctx.head_size <= FLASH_MAX_HEAD_SIZE,
                    "head size must be a multiple of 8 up to 256",
                )?;
                require(ctx.mask == MaskKind::None, "mask not supported")?;
                require(!ctx.has_attention_bias, "attention bias not supported")?;
                require(!ctx.output_qk, "cannot emit attention scores")
            }
        }
    }
}

fn require(condition: bool, reason: &str) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason.to_string())
    }
}

impl fmt::Display for KernelCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelCandidate {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "default" | "auto" => Ok(KernelCandidate::Default),
            "unfused" => Ok(KernelCandidate::Unfused),
            "fused_self" => Ok(KernelCandidate::FusedSelf),
            "fused_cross" => Ok(KernelCandidate::FusedCross),
            "memory_efficient" => Ok(KernelCandidate::MemoryEfficient),
            "flash_attention" | "flash" => Ok(KernelCandidate::FlashAttention),
            _ => Err(format!("unknown kernel '{raw}'")),
        }
    }
}

/// Which mask encoding a request carries, as seen by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskKind {
    None,
    KeyLengths,
    KeyPadding,
    RawIndex,
    Additive,
}

/// Everything a candidate predicate may inspect for one invocation.
///
/// Rebuilt on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionContext {
    pub device: DeviceKind,
    pub precision: Precision,
    pub cache_mode: CacheMode,
    pub is_cross_attention: bool,
    pub batch_size: usize,
    pub num_heads: usize,
    pub sequence_length: usize,
    pub kv_sequence_length: usize,
    pub total_sequence_length: usize,
    pub head_size: usize,
    pub v_head_size: usize,
    pub mask: MaskKind,
    pub has_attention_bias: bool,
    pub unidirectional: bool,
    pub output_qk: bool,
}

impl SelectionContext {
    pub fn new(
        layout: &ResolvedLayout,
        config: &AttentionConfig,
        device: DeviceKind,
        mask: MaskKind,
        has_attention_bias: bool,
        output_qk: bool,
    ) -> Self {
        Self {
            device,
            precision: layout.precision,
            cache_mode: layout.cache_mode,
            is_cross_attention: layout.is_cross_attention(),
            batch_size: layout.batch_size,
            num_heads: layout.num_heads,
            sequence_length: layout.sequence_length,
            kv_sequence_length: layout.kv_sequence_length,
            total_sequence_length: layout.total_sequence_length,
            head_size: layout.head_size,
            v_head_size: layout.v_head_size,
            mask,
            has_attention_bias,
            unidirectional: config.unidirectional,
            output_qk,
        }
    }

    /// Longer of the query and new key/value sequence lengths.
    pub fn longest_sequence(&self) -> usize {
        self.sequence_length.max(self.kv_sequence_length)
    }
}
