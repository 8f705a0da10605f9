use std::collections::HashMap;
use std::sync::Arc;

use super::{KernelCandidate, SelectionContext};
use crate::core::{AttentionError, AttentionKernel, KernelToggles};
use crate::fused::MemoryEfficientAttention;
use crate::reference::UnfusedAttention;

/// Compute backends available to one operator, keyed by candidate.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<KernelCandidate, Arc<dyn AttentionKernel>>,
}

impl KernelRegistry {
    /// Registry with no backends at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The in-crate backends: unfused reference and memory-efficient.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(UnfusedAttention::new()));
        registry.register(Arc::new(MemoryEfficientAttention::default()));
        registry
    }

    /// Install a backend under its own candidate, returning the one it replaces.
    pub fn register(
        &mut self,
        kernel: Arc<dyn AttentionKernel>,
    ) -> Option<Arc<dyn AttentionKernel>> {
        self.kernels.insert(kernel.candidate(), kernel)
    }

    pub fn get(&self, candidate: KernelCandidate) -> Option<&Arc<dyn AttentionKernel>> {
        self.kernels.get(&candidate)
    }

    pub fn contains(&self, candidate: KernelCandidate) -> bool {
        self.kernels.contains_key(&candidate)
    }
}

/// Picks exactly one kernel per invocation.
///
/// Holds no per-call state; every predicate is evaluated afresh against the
/// supplied context.
#[derive(Debug, Clone, Default)]
pub struct KernelSelector {
    toggles: KernelToggles,
}

impl KernelSelector {
    pub fn new(toggles: KernelToggles) -> Self {
        Self { toggles }
    }

    pub fn toggles(&self) -> &KernelToggles {
        &self.toggles
    }

    pub fn select(
        &self,
        ctx: &SelectionContext,
        registry: &KernelRegistry,
    ) -> Result<KernelCandidate, AttentionError> {
        match self.toggles.forced_kernel {
            KernelCandidate::Default => {
                let mut rejected = Vec::new();
                for candidate in KernelCandidate::PRIORITY {
                    match self.evaluate(candidate, ctx, registry) {
                        Ok(()) => return Ok(candidate),
                        Err(reason) => rejected.push(format!("{candidate}: {reason}")),
                    }
                }
                Err(AttentionError::unsupported(format!(
                    "no applicable kernel ({})",
                    rejected.join("; ")
                )))
            }
            forced => self.evaluate(forced, ctx, registry).map(|()| forced).map_err(|reason| {
                log::warn!("forced kernel {forced} is not applicable: {reason}");
                AttentionError::unsupported(format!(
                    "forced kernel {forced} is not applicable: {reason}"
                ))
            }),
        }
    }

    /// Why `candidate` cannot run this request, or `Ok` if it can.
    pub fn evaluate(
        &self,
        candidate: KernelCandidate,
        ctx: &SelectionContext,
        registry: &KernelRegistry,
    ) -> Result<(), String> {
        candidate.admits(ctx)?;
        if candidate == KernelCandidate::MemoryEfficient
            && ctx.longest_sequence() < self.toggles.memory_efficient_min_seq_len
        {
            return Err(format!(
                "sequence length {} below threshold {}",
                ctx.longest_sequence(),
                self.toggles.memory_efficient_min_seq_len
            ));
        }
        let backend = registry
            .get(candidate)
            .ok_or_else(|| "no backend registered".to_string())?;
        if !self.enabled(candidate, backend.is_vendor_library()) {
            return Err("disabled by toggle".to_string());
        }
        if !backend.supports(ctx) {
            return Err("backend declined".to_string());
        }
        Ok(())
    }

    fn enabled(&self, candidate: KernelCandidate, vendor_library: bool) -> bool {
        let toggles = &self.toggles;
        match candidate {
            KernelCandidate::Default => false,
            KernelCandidate::Unfused => true,
            KernelCandidate::FusedSelf => toggles.fused_self_attention,
            KernelCandidate::FusedCross => toggles.fused_cross_attention,
            KernelCandidate::MemoryEfficient => toggles.memory_efficient_attention,
            KernelCandidate::FlashAttention if vendor_library => {
                toggles.flash_attention && toggles.vendor_flash_attention
            }
            KernelCandidate::FlashAttention => toggles.flash_attention,
        }
    }
}
