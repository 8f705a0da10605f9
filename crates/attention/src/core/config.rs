//! Static attributes and process-wide kernel toggles.
//!
//! [`AttentionConfig`] mirrors the operator attributes (head count, mask fill
//! value, scale) while [`KernelToggles`] captures which kernel families may be
//! considered by the selector. Both are plain values: they are built once,
//! validated, and passed into [`MultiHeadAttention`](crate::MultiHeadAttention)
//! by value.

use std::{env, fs, path::Path};

use serde::Deserialize;

use crate::core::AttentionError;
use crate::selector::KernelCandidate;

/// Default additive fill applied to masked score positions.
pub const DEFAULT_MASK_FILTER_VALUE: f32 = -10_000.0;

/// Sequences shorter than this do not amortise the tiled kernel's overhead.
pub const DEFAULT_MEMORY_EFFICIENT_MIN_SEQ_LEN: usize = 256;

/// Which scores are reported through `output_qk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QkOutputMode {
    /// Scaled `QK^T` with the normalized bias already added.
    #[default]
    BeforeSoftmax,
    /// Softmax probabilities.
    AfterSoftmax,
}

/// Operator attributes shared by every invocation of one attention node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Number of attention heads; must divide the hidden sizes.
    pub num_heads: usize,
    /// Additive value written to masked positions. Never clamped.
    pub mask_filter_value: f32,
    /// Overrides the `1/sqrt(head_size)` score scale when set.
    pub scale: Option<f32>,
    /// Restrict every query to keys at or before its own position.
    pub unidirectional: bool,
    /// Present buffers alias the past buffers, pre-sized to capacity.
    pub past_present_share_buffer: bool,
    pub qk_output: QkOutputMode,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 1,
            mask_filter_value: DEFAULT_MASK_FILTER_VALUE,
            scale: None,
            unidirectional: false,
            past_present_share_buffer: false,
            qk_output: QkOutputMode::default(),
        }
    }
}

impl AttentionConfig {
    pub fn new(num_heads: usize) -> Self {
        Self {
            num_heads,
            ..Self::default()
        }
    }

    pub fn with_buffer_sharing(mut self, enabled: bool) -> Self {
        self.past_present_share_buffer = enabled;
        self
    }

    /// Score scale for the supplied head size.
    pub fn scale_for(&self, head_size: usize) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (head_size as f32).sqrt())
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        let mut errors = Vec::new();
        if self.num_heads == 0 {
            errors.push("num_heads must be greater than zero".to_string());
        }
        if self.mask_filter_value.is_nan() {
            errors.push("mask_filter_value must not be NaN".to_string());
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() || scale == 0.0 {
                errors.push(format!("scale must be finite and non-zero, got {scale}"));
            }
        }
        collect(errors)
    }
}

/// Independently switchable kernel families.
///
/// All families are enabled by default; the selector falls back along its
/// priority list when a toggle removes a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KernelToggles {
    pub flash_attention: bool,
    pub vendor_flash_attention: bool,
    pub fused_self_attention: bool,
    pub fused_cross_attention: bool,
    pub memory_efficient_attention: bool,
    pub memory_efficient_min_seq_len: usize,
    /// `Default` selects automatically; any other value pins that kernel.
    pub forced_kernel: KernelCandidate,
}

impl Default for KernelToggles {
    fn default() -> Self {
        Self {
            flash_attention: true,
            vendor_flash_attention: true,
            fused_self_attention: true,
            fused_cross_attention: true,
            memory_efficient_attention: true,
            memory_efficient_min_seq_len: DEFAULT_MEMORY_EFFICIENT_MIN_SEQ_LEN,
            forced_kernel: KernelCandidate::Default,
        }
    }
}

pub const ENV_DISABLE_FLASH: &str = "ATTENTION_DISABLE_FLASH";
pub const ENV_DISABLE_VENDOR_FLASH: &str = "ATTENTION_DISABLE_VENDOR_FLASH";
pub const ENV_DISABLE_FUSED_SELF: &str = "ATTENTION_DISABLE_FUSED_SELF";
pub const ENV_DISABLE_FUSED_CROSS: &str = "ATTENTION_DISABLE_FUSED_CROSS";
pub const ENV_DISABLE_MEMORY_EFFICIENT: &str = "ATTENTION_DISABLE_MEMORY_EFFICIENT";
pub const ENV_MEMORY_EFFICIENT_MIN_SEQ_LEN: &str = "ATTENTION_MEMORY_EFFICIENT_MIN_SEQ_LEN";
pub const ENV_FORCE_KERNEL: &str = "ATTENTION_FORCE_KERNEL";

impl KernelToggles {
    /// Pin selection to the reference kernel.
    pub fn unfused_only() -> Self {
        Self {
            forced_kernel: KernelCandidate::Unfused,
            ..Self::default()
        }
    }

    /// Pin selection to a single kernel.
    pub fn forcing(kernel: KernelCandidate) -> Self {
        Self {
            forced_kernel: kernel,
            ..Self::default()
        }
    }

    /// Defaults overridden by `ATTENTION_*` environment variables.
    ///
    /// Disable flags accept `1`/`true`/`yes`; unparsable values are ignored
    /// with a warning.
    pub fn from_env() -> Self {
        let mut toggles = Self::default();
        toggles.apply_env_overrides();
        toggles
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(disabled) = env_flag(ENV_DISABLE_FLASH) {
            self.flash_attention = !disabled;
        }
        if let Some(disabled) = env_flag(ENV_DISABLE_VENDOR_FLASH) {
            self.vendor_flash_attention = !disabled;
        }
        if let Some(disabled) = env_flag(ENV_DISABLE_FUSED_SELF) {
            self.fused_self_attention = !disabled;
        }
        if let Some(disabled) = env_flag(ENV_DISABLE_FUSED_CROSS) {
            self.fused_cross_attention = !disabled;
        }
        if let Some(disabled) = env_flag(ENV_DISABLE_MEMORY_EFFICIENT) {
            self.memory_efficient_attention = !disabled;
        }
        if let Ok(raw) = env::var(ENV_MEMORY_EFFICIENT_MIN_SEQ_LEN) {
            match raw.trim().parse::<usize>() {
                Ok(value) => self.memory_efficient_min_seq_len = value,
                Err(_) => log::warn!("ignoring {ENV_MEMORY_EFFICIENT_MIN_SEQ_LEN}={raw:?}"),
            }
        }
        if let Ok(raw) = env::var(ENV_FORCE_KERNEL) {
            match raw.trim().parse::<KernelCandidate>() {
                Ok(kernel) => self.forced_kernel = kernel,
                Err(_) => log::warn!("ignoring {ENV_FORCE_KERNEL}={raw:?}"),
            }
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => {
            log::warn!("ignoring {name}={raw:?}");
            None
        }
    }
}

/// File-level configuration bundling attributes and toggles.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub attention: AttentionConfig,
    #[serde(default)]
    pub kernels: KernelToggles,
}

impl OperatorConfig {
    /// Load from `.toml` or `.json`, then validate.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AttentionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: OperatorConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(AttentionError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, AttentionError> {
        let config: OperatorConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        self.attention.validate()
    }
}

fn collect(errors: Vec<String>) -> Result<(), AttentionError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AttentionError::InvalidConfig(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_every_family() {
        let toggles = KernelToggles::default();
        assert!(toggles.flash_attention);
        assert!(toggles.vendor_flash_attention);
        assert!(toggles.fused_self_attention);
        assert!(toggles.fused_cross_attention);
        assert!(toggles.memory_efficient_attention);
        assert_eq!(toggles.forced_kernel, KernelCandidate::Default);

        let attention = AttentionConfig::default();
        assert_eq!(attention.mask_filter_value, DEFAULT_MASK_FILTER_VALUE);
        assert!(!attention.past_present_share_buffer);
    }

    #[test]
    fn scale_defaults_to_inverse_sqrt_head_size() {
        let config = AttentionConfig::new(2);
        assert!((config.scale_for(16) - 0.25).abs() < 1e-6);

        let config = AttentionConfig {
            scale: Some(0.5),
            ..AttentionConfig::new(2)
        };
        assert_eq!(config.scale_for(16), 0.5);
    }

    #[test]
    fn validation_collects_every_violation() {
        let config = AttentionConfig {
            num_heads: 0,
            scale: Some(0.0),
            ..AttentionConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("num_heads"));
        assert!(err.contains("scale"));
    }

    #[test]
    fn toml_round_trips_partial_tables() {
        let config = OperatorConfig::from_toml_str(
            r#"
            [attention]
            num_heads = 4
            mask_filter_value = -1e9
            qk_output = "after_softmax"

            [kernels]
            memory_efficient_attention = false
            forced_kernel = "unfused"
            "#,
        )
        .unwrap();
        assert_eq!(config.attention.num_heads, 4);
        assert_eq!(config.attention.qk_output, QkOutputMode::AfterSoftmax);
        assert!(!config.kernels.memory_efficient_attention);
        assert!(config.kernels.flash_attention);
        assert_eq!(config.kernels.forced_kernel, KernelCandidate::Unfused);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = std::env::temp_dir().join("multihead-attention-config-test.yaml");
        fs::write(&dir, "attention: {}").unwrap();
        let err = OperatorConfig::from_path(&dir).unwrap_err();
        assert!(matches!(err, AttentionError::ConfigFormat(_)));
        let _ = fs::remove_file(dir);
    }
}
