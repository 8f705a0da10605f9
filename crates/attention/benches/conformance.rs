//! Cross-kernel conformance harness.
//! Run with: `cargo bench -p multihead-attention --bench conformance`
//!
//! Every in-crate kernel is forced in turn through the full operator and
//! compared with the unfused reference on the same seeded inputs, both
//! unmasked and causal.

#[path = "common/mod.rs"]
mod util;

use std::error::Error;

use candle_core::{DType, Device, Tensor};
use multihead_attention::{
    AttentionConfig, AttentionInputs, KernelCandidate, KernelToggles, MultiHeadAttention,
    Precision,
};
use util::{format_markdown_table, rng, seeded_tensor, update_results};

#[derive(Clone, Copy)]
struct Case {
    batch: usize,
    heads: usize,
    seq_len: usize,
    head_dim: usize,
    dtype: DType,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("conformance harness failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let device = Device::Cpu;
    let seq_lengths = [4usize, 64, 256, 1024];
    let head_dims = [16usize, 64, 128];
    let dtypes = [DType::F32, DType::F16];
    let kernels = [KernelCandidate::MemoryEfficient];

    let mut rows = Vec::new();
    for &seq_len in &seq_lengths {
        for &head_dim in &head_dims {
            let variants = dtypes
                .into_iter()
                .flat_map(|dtype| [(dtype, false), (dtype, true)]);
            for (dtype, causal) in variants {
                let case = Case {
                    batch: 2,
                    heads: 2,
                    seq_len,
                    head_dim,
                    dtype,
                };
                let inputs = build_inputs(&device, &case)?;
                let config = AttentionConfig {
                    unidirectional: causal,
                    ..AttentionConfig::new(case.heads)
                };
                let reference =
                    MultiHeadAttention::new(config.clone(), KernelToggles::unfused_only())?
                        .forward(&inputs)?
                        .output;

                let tolerance = Precision::from_dtype(dtype)
                    .map(Precision::tolerance)
                    .unwrap_or(0.02);
                for &kernel in &kernels {
                    let toggles = KernelToggles {
                        memory_efficient_min_seq_len: 0,
                        ..KernelToggles::forcing(kernel)
                    };
                    let operator = MultiHeadAttention::new(config.clone(), toggles)?;
                    let output = operator.forward(&inputs)?.output;
                    let max_abs = max_abs_diff(&output, &reference)?;
                    if max_abs > tolerance {
                        return Err(format!(
                            "{kernel} breached tolerance for seq_len={seq_len} head_dim={head_dim} dtype={dtype:?} causal={causal}: {max_abs:.3e} > {tolerance}"
                        )
                        .into());
                    }
                    rows.push(vec![
                        kernel.to_string(),
                        format!(
                            "({},{},{},{})",
                            case.batch, case.heads, case.seq_len, case.head_dim
                        ),
                        format!("{dtype:?}"),
                        if causal { "causal" } else { "none" }.to_string(),
                        format!("{max_abs:.2e}"),
                        format!("{tolerance}"),
                    ]);
                }
            }
        }
    }

    let table = format_markdown_table(
        &["kernel", "shape", "dtype", "mask", "max abs", "tolerance"],
        &rows,
    );
    println!("\nConformance summary:\n{table}");
    update_results("Conformance", &table)?;
    Ok(())
}

fn build_inputs(device: &Device, case: &Case) -> Result<AttentionInputs, Box<dyn Error>> {
    let mut rng = rng(case.seq_len as u64 * 1_000 + case.head_dim as u64);
    let hidden = case.heads * case.head_dim;
    let dims = [case.batch, case.seq_len, hidden];
    let query = seeded_tensor(&mut rng, &dims, case.dtype, device)?;
    let key = seeded_tensor(&mut rng, &dims, case.dtype, device)?;
    let value = seeded_tensor(&mut rng, &dims, case.dtype, device)?;
    Ok(AttentionInputs::new(query).with_key_value(key, value))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_vec0::<f32>()
}
