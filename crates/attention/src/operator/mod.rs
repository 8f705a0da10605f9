//! End-to-end multi-head attention operator.
//!
//! One [`forward`](MultiHeadAttention::forward) call runs, in order: layout
//! resolution, head preparation, mask classification, kernel selection, the
//! cache state machine, bias normalization and kernel dispatch. Every step
//! that can fail does so before the kernel runs; buffer-shared past tensors
//! are written only after a kernel has been selected.

use std::sync::{Arc, OnceLock};

use candle_core::Tensor;

use crate::core::{
    AttentionConfig, AttentionError, AttentionKernel, AttentionProblem, DeviceKind,
    KernelToggles, OperatorConfig,
};
use crate::kv_cache::CacheManager;
use crate::layout::{prepare_heads, resolve, AttentionInputs, CacheMode};
use crate::masks::{classify, normalize};
use crate::selector::{KernelCandidate, KernelRegistry, KernelSelector, SelectionContext};

/// Results of one invocation.
#[derive(Debug, Clone)]
pub struct AttentionOutputs {
    /// `[batch, seq, v_hidden]`
    pub output: Tensor,
    /// `[batch, heads, present_seq, head]`, emitted whenever a cache is in use
    /// or present outputs were requested.
    pub present_key: Option<Tensor>,
    pub present_value: Option<Tensor>,
    /// `[batch, heads, seq, total_seq]` when requested.
    pub output_qk: Option<Tensor>,
    /// Kernel that produced `output`.
    pub kernel: KernelCandidate,
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    config: AttentionConfig,
    selector: KernelSelector,
    registry: KernelRegistry,
    cache: CacheManager,
    first_call: OnceLock<()>,
}

impl MultiHeadAttention {
    /// Operator backed by the in-crate kernels.
    pub fn new(config: AttentionConfig, toggles: KernelToggles) -> Result<Self, AttentionError> {
        Self::with_registry(config, toggles, KernelRegistry::with_defaults())
    }

    pub fn with_registry(
        config: AttentionConfig,
        toggles: KernelToggles,
        registry: KernelRegistry,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        Ok(Self {
            config,
            selector: KernelSelector::new(toggles),
            registry,
            cache: CacheManager::new(),
            first_call: OnceLock::new(),
        })
    }

    pub fn from_config(config: OperatorConfig) -> Result<Self, AttentionError> {
        Self::new(config.attention, config.kernels)
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn toggles(&self) -> &KernelToggles {
        self.selector.toggles()
    }

    /// Add or replace a compute backend.
    pub fn register_kernel(&mut self, kernel: Arc<dyn AttentionKernel>) {
        if let Some(previous) = self.registry.register(kernel) {
            log::debug!("replaced {} kernel backend", previous.candidate());
        }
    }

    pub fn forward(&self, inputs: &AttentionInputs) -> Result<AttentionOutputs, AttentionError> {
        if self.first_call.set(()).is_ok() {
            let toggles = self.selector.toggles();
            log::info!(
                "attention::operator init num_heads={} mask_filter_value={} unidirectional={} share_buffer={} flash={} vendor_flash={} fused_self={} fused_cross={} memory_efficient={} min_seq_len={} forced={}",
                self.config.num_heads,
                self.config.mask_filter_value,
                self.config.unidirectional,
                self.config.past_present_share_buffer,
                toggles.flash_attention,
                toggles.vendor_flash_attention,
                toggles.fused_self_attention,
                toggles.fused_cross_attention,
                toggles.memory_efficient_attention,
                toggles.memory_efficient_min_seq_len,
                toggles.forced_kernel
            );
        }

        let layout = resolve(inputs, &self.config)?;
        log::debug!(
            "attention layout={:?} cache={:?} batch={} seq={} kv_seq={} past={} total={} heads={} head_size={} v_head_size={}",
            layout.variant,
            layout.cache_mode,
            layout.batch_size,
            layout.sequence_length,
            layout.kv_sequence_length,
            layout.past_sequence_length,
            layout.total_sequence_length,
            layout.num_heads,
            layout.head_size,
            layout.v_head_size
        );
        let heads = prepare_heads(inputs, &layout)?;
        let mask = classify(inputs.key_padding_mask.as_ref(), &layout)?;

        let device = inputs.query.device();
        let ctx = SelectionContext::new(
            &layout,
            &self.config,
            DeviceKind::from_device(device),
            mask.kind(),
            inputs.attention_bias.is_some(),
            inputs.output_qk,
        );
        let candidate = self.selector.select(&ctx, &self.registry)?;
        let kernel = self.registry.get(candidate).ok_or_else(|| {
            AttentionError::unsupported(format!("no backend registered for {candidate}"))
        })?;
        log::debug!("attention kernel={candidate}");

        let cache = self.cache.resolve(&layout, &heads, inputs)?;
        let bias = normalize(
            &mask,
            inputs.attention_bias.as_ref(),
            &layout,
            &self.config,
            device,
        )?;

        let problem = AttentionProblem {
            query: heads.query,
            key: cache.key().clone(),
            value: cache.value().clone(),
            bias: bias.into_tensor(),
            scale: self.config.scale_for(layout.head_size),
            output_qk: inputs.output_qk.then_some(self.config.qk_output),
        };
        let result = kernel.attend(&problem).map_err(|err| match err {
            AttentionError::Tensor(source) => AttentionError::BackendExecutionFailure {
                kernel: candidate,
                message: source.to_string(),
            },
            other => other,
        })?;

        let output = result.context.transpose(1, 2)?.reshape((
            layout.batch_size,
            layout.sequence_length,
            layout.v_hidden_size,
        ))?;
        let (present_key, present_value) =
            if layout.cache_mode != CacheMode::NoCache || inputs.output_present {
                cache.into_present()
            } else {
                (None, None)
            };

        Ok(AttentionOutputs {
            output,
            present_key,
            present_value,
            output_qk: result.attention_scores,
            kernel: candidate,
        })
    }
}
