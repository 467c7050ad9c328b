use std::{sync::Arc, thread};

use anyhow::Result;
use candle_core::{Device, Tensor};
use causal_conv::{
    channel_group, ChannelRank, ConvDescriptor, ConvInput, InflatedCausalConv3d, InflationMode,
    MemoryState, SequenceParallelGroup,
};

const FRAMES_PER_RANK: usize = 8;

fn ramp(dims: &[usize], scale: f32, phase: usize) -> Result<Tensor> {
    let total = dims.iter().product::<usize>();
    let data = (0..total)
        .map(|i| (((i + phase) * 31 % 47) as f32 - 23.0) * scale)
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(data, dims, &Device::Cpu)?)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?)
}

fn build_layer() -> Result<InflatedCausalConv3d> {
    let descriptor = ConvDescriptor::new(2, 2, [3, 3, 3]).with_padding([1, 1, 1]);
    Ok(InflatedCausalConv3d::new(
        ramp(&[2, 2, 3, 3, 3], 0.03, 2)?,
        Some(ramp(&[2], 0.1, 9)?),
        descriptor,
        InflationMode::Tail,
    )?)
}

/// Runs two streamed calls on one rank and returns its output shard per call.
fn run_rank(member: ChannelRank, video: Tensor) -> Result<Vec<Tensor>> {
    let rank = member.rank();
    let world_size = member.world_size();
    let mut layer = build_layer()?;
    layer.set_group(Some(Arc::new(member)));

    let mut outputs = Vec::new();
    for (call, state) in [MemoryState::Initializing, MemoryState::Active].into_iter().enumerate() {
        let start = (call * world_size + rank) * FRAMES_PER_RANK;
        let shard = video.narrow(2, start, FRAMES_PER_RANK)?;
        outputs.push(layer.forward(shard, state)?.into_single()?);
    }
    Ok(outputs)
}

#[test]
fn two_ranks_reproduce_single_process_stream() -> Result<()> {
    let world_size = 2;
    let video = ramp(&[1, 2, 2 * world_size * FRAMES_PER_RANK, 6, 6], 0.05, 0)?;

    let mut reference = build_layer()?;
    let expected = reference.forward(video.clone(), MemoryState::Disabled)?.into_single()?;

    let handles = channel_group(world_size)
        .into_iter()
        .map(|member| {
            let video = video.clone();
            thread::spawn(move || run_rank(member, video))
        })
        .collect::<Vec<_>>();
    let mut per_rank = Vec::new();
    for handle in handles {
        per_rank.push(handle.join().expect("rank thread panicked")?);
    }

    for call in 0..2 {
        for (rank, outputs) in per_rank.iter().enumerate() {
            let start = (call * world_size + rank) * FRAMES_PER_RANK;
            let want = expected.narrow(2, start, FRAMES_PER_RANK)?;
            let diff = max_diff(&outputs[call], &want)?;
            assert!(diff < 1e-4, "call {call} rank {rank} diff {diff}");
        }
    }
    Ok(())
}

#[test]
fn single_rank_group_matches_local_layer() -> Result<()> {
    let video = ramp(&[1, 2, 12, 6, 6], 0.05, 5)?;
    let member = channel_group(1).pop().expect("one rank");

    let mut local = build_layer()?;
    let mut grouped = build_layer()?;
    grouped.set_group(Some(Arc::new(member)));

    for (offset, state) in [(0, MemoryState::Initializing), (6, MemoryState::Active)] {
        let chunk = video.narrow(2, offset, 6)?;
        let a = local.forward(chunk.clone(), state)?.into_single()?;
        let b = grouped.forward(chunk, state)?.into_single()?;
        assert!(max_diff(&a, &b)? < 1e-5);

        let (ma, mb) = match (local.memory(), grouped.memory()) {
            (Some(ma), Some(mb)) => (ma.clone(), mb.clone()),
            other => anyhow::bail!("both layers should record memory, got {other:?}"),
        };
        assert_eq!(max_diff(&ma, &mb)?, 0.0);
    }
    Ok(())
}

#[test]
fn chunk_lists_stay_chunk_lists_across_ranks() -> Result<()> {
    let video = ramp(&[1, 2, 16, 4, 4], 0.05, 1)?;
    let mut reference = build_layer()?;
    let expected = reference.forward(video.clone(), MemoryState::Disabled)?.into_single()?;

    let handles = channel_group(2)
        .into_iter()
        .map(|member| {
            let video = video.clone();
            thread::spawn(move || -> Result<Vec<Tensor>> {
                let start = member.rank() * 8;
                let mut layer = build_layer()?;
                layer.set_group(Some(Arc::new(member)));
                let chunks = vec![video.narrow(2, start, 5)?, video.narrow(2, start + 5, 3)?];
                match layer.forward(chunks, MemoryState::Disabled)? {
                    ConvInput::Chunks(outputs) => Ok(outputs),
                    ConvInput::Single(_) => anyhow::bail!("expected chunked output"),
                }
            })
        })
        .collect::<Vec<_>>();

    let mut shards = Vec::new();
    for handle in handles {
        let outputs = handle.join().expect("rank thread panicked")?;
        assert_eq!(outputs.len(), 2);
        shards.extend(outputs);
    }
    let joined = Tensor::cat(&shards, 2)?;
    assert!(max_diff(&joined, &expected)? < 1e-4);
    Ok(())
}
