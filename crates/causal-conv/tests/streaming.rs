use anyhow::Result;
use candle_core::{Device, Tensor};
use causal_conv::{ConvDescriptor, ConvError, InflatedCausalConv3d, InflationMode, MemoryState};
use layers::MemoryLimit;

fn ramp(dims: &[usize], scale: f32, phase: usize) -> Result<Tensor> {
    let total = dims.iter().product::<usize>();
    let data = (0..total)
        .map(|i| (((i + phase) * 29 % 53) as f32 - 26.0) * scale)
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(data, dims, &Device::Cpu)?)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?)
}

fn build_layer(temporal_stride: usize, limit: MemoryLimit) -> Result<InflatedCausalConv3d> {
    let descriptor = ConvDescriptor::new(2, 3, [3, 3, 3])
        .with_stride([temporal_stride, 1, 1])
        .with_padding([1, 1, 1]);
    let mut layer = InflatedCausalConv3d::new(
        ramp(&[3, 2, 3, 3, 3], 0.02, 1)?,
        Some(ramp(&[3], 0.1, 4)?),
        descriptor,
        InflationMode::Tail,
    )?;
    layer.set_memory_limit(limit);
    Ok(layer)
}

fn limits() -> [MemoryLimit; 2] {
    [MemoryLimit::unlimited(), MemoryLimit::from_bytes(8192)]
}

#[test]
fn chunked_stream_matches_whole_sequence() -> Result<()> {
    let video = ramp(&[1, 2, 17, 12, 12], 0.05, 0)?;
    for stride in [1, 2] {
        for limit in limits() {
            let mut whole = build_layer(stride, limit)?;
            let expected = whole.forward(video.clone(), MemoryState::Disabled)?.into_single()?;

            let mut streamed = build_layer(stride, limit)?;
            let first = streamed
                .forward(video.narrow(2, 0, 9)?, MemoryState::Initializing)?
                .into_single()?;
            let second = streamed
                .forward(video.narrow(2, 9, 8)?, MemoryState::Active)?
                .into_single()?;
            let joined = Tensor::cat(&[&first, &second], 2)?;

            assert_eq!(joined.dims(), expected.dims(), "stride {stride} limit {limit:?}");
            let diff = max_diff(&joined, &expected)?;
            assert!(diff < 1e-4, "stride {stride} limit {limit:?} diff {diff}");
        }
    }
    Ok(())
}

#[test]
fn memory_limit_does_not_change_the_output() -> Result<()> {
    let video = ramp(&[1, 2, 6, 12, 12], 0.05, 3)?;
    let mut direct = build_layer(1, MemoryLimit::unlimited())?;
    let mut bounded = build_layer(1, MemoryLimit::from_bytes(4096))?;

    let expected = direct.forward(video.clone(), MemoryState::Initializing)?.into_single()?;
    let actual = bounded.forward(video, MemoryState::Initializing)?.into_single()?;
    assert!(max_diff(&actual, &expected)? < 1e-4);

    let (direct_memory, bounded_memory) = match (direct.memory(), bounded.memory()) {
        (Some(a), Some(b)) => (a.clone(), b.clone()),
        other => anyhow::bail!("both layers should record memory, got {other:?}"),
    };
    assert_eq!(max_diff(&direct_memory, &bounded_memory)?, 0.0);
    Ok(())
}

#[test]
fn initializing_discards_the_previous_stream() -> Result<()> {
    let a = ramp(&[1, 2, 5, 6, 6], 0.05, 0)?;
    let b = ramp(&[1, 2, 5, 6, 6], 0.05, 17)?;

    let mut fresh = build_layer(1, MemoryLimit::unlimited())?;
    let expected = fresh.forward(b.clone(), MemoryState::Initializing)?.into_single()?;

    let mut reused = build_layer(1, MemoryLimit::unlimited())?;
    reused.forward(a, MemoryState::Initializing)?;
    let actual = reused.forward(b, MemoryState::Initializing)?.into_single()?;
    assert_eq!(max_diff(&actual, &expected)?, 0.0);
    Ok(())
}

#[test]
fn unset_state_is_rejected_on_every_path() -> Result<()> {
    let video = ramp(&[1, 2, 4, 6, 6], 0.05, 0)?;
    for limit in limits() {
        let mut layer = build_layer(1, limit)?;
        let result = layer.forward(video.clone(), MemoryState::Unset);
        assert!(matches!(result, Err(ConvError::Precondition(_))));
    }
    Ok(())
}

#[test]
fn impossible_memory_limit_fails_instead_of_truncating() -> Result<()> {
    let video = ramp(&[1, 2, 4, 6, 6], 0.05, 0)?;
    let mut layer = build_layer(1, MemoryLimit::from_bytes(1))?;
    let result = layer.forward(video, MemoryState::Disabled);
    assert!(matches!(result, Err(ConvError::Precondition(_))));
    Ok(())
}
