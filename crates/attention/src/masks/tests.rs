use super::*;
use crate::core::AttentionConfig;
use crate::layout::{resolve, AttentionInputs};
use candle_core::{Device, Result};

const FILL: f32 = -10_000.0;

fn idx(b: usize, q: usize, k: usize, q_len: usize, k_len: usize) -> usize {
    ((b * q_len) + q) * k_len + k
}

fn layout(batch: usize, seq: usize, kv_seq: usize) -> ResolvedLayout {
    let device = Device::Cpu;
    let query = Tensor::zeros((batch, seq, 4), DType::F32, &device).unwrap();
    let key = Tensor::zeros((batch, kv_seq, 4), DType::F32, &device).unwrap();
    let inputs = AttentionInputs::new(query).with_key_value(key.clone(), key);
    resolve(&inputs, &AttentionConfig::new(2)).unwrap()
}

fn normalized(mask: Option<&Tensor>, layout: &ResolvedLayout) -> Vec<f32> {
    let config = AttentionConfig::new(2);
    let mask = classify(mask, layout).unwrap();
    normalize(&mask, None, layout, &config, &Device::Cpu)
        .unwrap()
        .into_tensor()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

#[test]
fn key_lengths_and_padding_rows_agree() -> Result<()> {
    let device = Device::Cpu;
    let layout = layout(2, 3, 4);
    let lengths = Tensor::new(&[2i64, 3], &device)?;
    let padding = Tensor::new(&[[1i64, 1, 0, 0], [1, 1, 1, 0]], &device)?;

    let from_lengths = normalized(Some(&lengths), &layout);
    let from_padding = normalized(Some(&padding), &layout);
    assert_eq!(from_lengths, from_padding);

    assert_eq!(from_lengths[idx(0, 0, 1, 3, 4)], 0.0);
    assert_eq!(from_lengths[idx(0, 2, 2, 3, 4)], FILL);
    assert_eq!(from_lengths[idx(1, 1, 2, 3, 4)], 0.0);
    assert_eq!(from_lengths[idx(1, 1, 3, 3, 4)], FILL);
    Ok(())
}

#[test]
fn raw_index_mask_uses_key_lengths() -> Result<()> {
    let device = Device::Cpu;
    let layout = layout(2, 3, 4);
    let raw = Tensor::new(&[2i64, 3, 0, 3, 6, 0, 2, 5], &device)?;
    let lengths = Tensor::new(&[2i64, 3], &device)?;

    let mask = classify(Some(&raw), &layout).unwrap();
    assert_eq!(mask.kind(), MaskKind::RawIndex);
    assert_eq!(normalized(Some(&raw), &layout), normalized(Some(&lengths), &layout));
    Ok(())
}

#[test]
fn raw_index_rejects_decreasing_offsets() {
    let err = RawIndexMask::decode(&[2, 3, 0, 3, 1, 0, 2, 5], 2).unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
}

#[test]
fn classify_reports_encoding() -> Result<()> {
    let device = Device::Cpu;
    let layout = layout(2, 3, 4);
    assert_eq!(classify(None, &layout).unwrap().kind(), MaskKind::None);

    let lengths = Tensor::new(&[4u32, 1], &device)?;
    assert_eq!(classify(Some(&lengths), &layout).unwrap().kind(), MaskKind::KeyLengths);

    let additive = Tensor::zeros((1, 2, 3, 4), DType::F32, &device)?;
    assert_eq!(classify(Some(&additive), &layout).unwrap().kind(), MaskKind::Additive);
    Ok(())
}

#[test]
fn malformed_masks_are_shape_mismatches() -> Result<()> {
    let device = Device::Cpu;
    let layout = layout(2, 3, 4);
    let cases = [
        Tensor::new(&[[1i64, 1, 1], [1, 1, 1]], &device)?,
        Tensor::new(&[1i64, 2, 3], &device)?,
        Tensor::new(&[-1i64, 2], &device)?,
        Tensor::zeros((2, 3, 3, 4), DType::F32, &device)?,
    ];
    for mask in cases {
        let err = classify(Some(&mask), &layout).unwrap_err();
        assert!(
            matches!(err, AttentionError::ShapeMismatch { .. }),
            "{:?} accepted",
            mask.dims()
        );
    }
    Ok(())
}

#[test]
fn no_mask_and_no_bias_normalizes_to_nothing() {
    let layout = layout(1, 2, 2);
    let bias = normalize(
        &AttentionMask::None,
        None,
        &layout,
        &AttentionConfig::new(2),
        &Device::Cpu,
    )
    .unwrap();
    assert!(bias.is_none());
}

#[test]
fn attention_bias_adds_to_mask() -> Result<()> {
    let device = Device::Cpu;
    let layout = layout(2, 3, 4);
    let lengths = Tensor::new(&[2i64, 4], &device)?;
    let attention_bias = Tensor::full(0.5f32, (1, 2, 3, 4), &device)?;
    let mask = classify(Some(&lengths), &layout).unwrap();

    let bias = normalize(
        &mask,
        Some(&attention_bias),
        &layout,
        &AttentionConfig::new(2),
        &device,
    )
    .unwrap()
    .into_tensor()
    .unwrap();
    assert_eq!(bias.dims(), &[2, 2, 3, 4]);

    let values = bias.flatten_all()?.to_vec1::<f32>()?;
    let at = |b: usize, h: usize, q: usize, k: usize| values[((b * 2 + h) * 3 + q) * 4 + k];
    assert_eq!(at(0, 0, 0, 3), FILL + 0.5);
    assert_eq!(at(0, 1, 2, 1), 0.5);
    assert_eq!(at(1, 1, 2, 3), 0.5);
    Ok(())
}

#[test]
fn causal_bias_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let q_len = 3;
    let k_len = 5;

    let mask = causal_bias(&device, q_len, k_len, FILL)?;
    assert_eq!(mask.dims(), &[1, 1, q_len, k_len]);
    let values = mask.flatten_all()?.to_vec1::<f32>()?;

    // Earliest query sees the prefix of length k_len - q_len plus itself.
    assert_eq!(values[idx(0, 0, 2, q_len, k_len)], 0.0);
    assert_eq!(values[idx(0, 0, 3, q_len, k_len)], FILL);
    assert_eq!(values[idx(0, 2, 4, q_len, k_len)], 0.0);

    let single = causal_bias(&device, 1, 4, FILL)?;
    assert_eq!(single.flatten_all()?.to_vec1::<f32>()?, vec![0.0; 4]);
    Ok(())
}

#[test]
fn causal_and_padding_mask_once() -> Result<()> {
    let device = Device::Cpu;
    let layout = layout(1, 3, 3);
    let config = AttentionConfig {
        unidirectional: true,
        ..AttentionConfig::new(2)
    };
    let lengths = Tensor::new(&[2i64], &device)?;
    let mask = classify(Some(&lengths), &layout).unwrap();
    let values = normalize(&mask, None, &layout, &config, &device)
        .unwrap()
        .into_tensor()
        .unwrap()
        .flatten_all()?
        .to_vec1::<f32>()?;

    // Query 0, key 2 is masked by both rules and still carries one fill.
    assert_eq!(values[idx(0, 0, 2, 3, 3)], FILL);
    // Query 2, key 2 is allowed causally but padded.
    assert_eq!(values[idx(0, 2, 2, 3, 3)], FILL);
    // Query 1, key 2 is masked causally only.
    assert_eq!(values[idx(0, 1, 2, 3, 3)], FILL);
    assert_eq!(values[idx(0, 1, 1, 3, 3)], 0.0);
    Ok(())
}

#[test]
fn custom_fill_value_is_not_clamped() -> Result<()> {
    let device = Device::Cpu;
    let layout = layout(1, 1, 2);
    let config = AttentionConfig {
        mask_filter_value: -3.0e38,
        ..AttentionConfig::new(2)
    };
    let mask = classify(Some(&Tensor::new(&[1i64], &device)?), &layout).unwrap();
    let values = normalize(&mask, None, &layout, &config, &device)
        .unwrap()
        .into_tensor()
        .unwrap()
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert_eq!(values, vec![0.0, -3.0e38]);
    Ok(())
}

#[test]
fn validity_rows_must_share_length() {
    let err = bias_from_validity(&Device::Cpu, &[vec![true, false], vec![true]], 1, FILL);
    assert!(err.is_err());
}

#[test]
fn kv_length_padding_mask_keeps_past_valid() {
    let device = Device::Cpu;
    let query = Tensor::zeros((1, 1, 4), DType::F32, &device).unwrap();
    let past = Tensor::zeros((1, 2, 3, 2), DType::F32, &device).unwrap();
    let inputs = AttentionInputs::new(query.clone())
        .with_key_value(query.clone(), query)
        .with_past(past.clone(), past, None);
    let layout = resolve(&inputs, &AttentionConfig::new(2)).unwrap();
    assert_eq!(layout.total_sequence_length, 4);

    let newest_only = Tensor::new(&[[0i64]], &device).unwrap();
    let full = Tensor::new(&[[1i64, 1, 1, 0]], &device).unwrap();
    assert_eq!(
        normalized(Some(&newest_only), &layout),
        normalized(Some(&full), &layout)
    );
    assert_eq!(
        normalized(Some(&newest_only), &layout),
        vec![0.0, 0.0, 0.0, FILL]
    );

    let wrong = Tensor::new(&[[1i64, 1]], &device).unwrap();
    assert!(matches!(
        classify(Some(&wrong), &layout),
        Err(AttentionError::ShapeMismatch { .. })
    ));
}

#[test]
fn positive_fill_still_masks_both_rules() -> Result<()> {
    let device = Device::Cpu;
    let layout = layout(1, 2, 2);
    let config = AttentionConfig {
        unidirectional: true,
        mask_filter_value: 5.0,
        ..AttentionConfig::new(2)
    };
    let lengths = Tensor::new(&[1i64], &device)?;
    let mask = classify(Some(&lengths), &layout).unwrap();
    let values = normalize(&mask, None, &layout, &config, &device)
        .unwrap()
        .into_tensor()
        .unwrap()
        .flatten_all()?
        .to_vec1::<f32>()?;

    // Key 1 is padded for both queries; query 0 also sees it causally masked.
    assert_eq!(values, vec![0.0, 5.0, 0.0, 5.0]);
    Ok(())
}
