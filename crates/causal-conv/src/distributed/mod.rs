//! Boundary exchange between sequence-parallel ranks.
//!
//! When the temporal axis of a video is sharded over a linear chain of ranks,
//! every rank but the first needs the trailing frames of its predecessor's
//! shard, and every rank but the last must send its own trailing frames on.
//! Topology (rank, world size, transport) is owned by the caller and only
//! queried here.

mod local;

pub use local::{channel_group, ChannelRank};

use candle_core::{DType, Device, Tensor};
use log::debug;

use crate::{
    cache::{repeat_first_frame, tail_frames},
    descriptor::TIME_DIM,
    errors::{ConvError, Result},
};

/// Read-only view of a sequence-parallel group plus blocking point-to-point
/// transport between its members.
pub trait SequenceParallelGroup {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Successor in the chain; the last rank wraps to rank 0.
    fn next_rank(&self) -> usize {
        (self.rank() + 1) % self.world_size()
    }

    /// Predecessor in the chain; rank 0 wraps to the last rank.
    fn prev_rank(&self) -> usize {
        (self.rank() + self.world_size() - 1) % self.world_size()
    }

    fn is_first(&self) -> bool {
        self.rank() == 0
    }

    fn is_last(&self) -> bool {
        self.rank() + 1 == self.world_size()
    }

    /// Sends `tensor` to `dst`. Blocks at most until the peer can take it.
    fn send(&self, tensor: &Tensor, dst: usize) -> Result<()>;

    /// Receives a tensor of `shape` from `src`, blocking until it arrives.
    fn recv(&self, shape: &[usize], dtype: DType, device: &Device, src: usize) -> Result<Tensor>;
}

/// Computes the temporal context the first input chunk of this rank must be
/// prefixed with, exchanging shard boundaries with neighbouring ranks.
///
/// * rank 0 uses its stored `memory`, or else `times` copies of its first frame;
/// * every other rank receives `cache_size` frames from `prev_rank`;
/// * every rank but the last sends the trailing `cache_size` frames of its
///   last chunk to `next_rank`.
///
/// Without a group this is the purely local rank-0 behaviour.
pub fn exchange_boundary(
    group: Option<&dyn SequenceParallelGroup>,
    inputs: &[Tensor],
    cache_size: usize,
    memory: Option<&Tensor>,
    times: usize,
) -> Result<Option<Tensor>> {
    let (first, last) = match (inputs.first(), inputs.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(ConvError::precondition("no input chunks supplied")),
    };
    let rank = group.map_or(0, |g| g.rank());
    let is_first = group.map_or(true, |g| g.is_first());

    let mut context = None;
    if is_first {
        if let Some(memory) = memory {
            context = Some(memory.to_device(first.device())?.to_dtype(first.dtype())?);
        } else if times > 0 {
            context = Some(repeat_first_frame(first, times)?);
        }
    }

    let Some(group) = group else {
        return Ok(context);
    };
    if cache_size == 0 {
        return Ok(context);
    }

    if !group.is_last() {
        if cache_size > last.dim(TIME_DIM)? && inputs.len() == 1 {
            return Err(ConvError::precondition(format!(
                "rank {rank}: boundary of {cache_size} frames exceeds its {} local frames",
                last.dim(TIME_DIM)?
            )));
        }
        let boundary = tail_frames(last, cache_size)?;
        debug!("rank {rank}: send boundary {:?} to {}", boundary.dims(), group.next_rank());
        group.send(&boundary, group.next_rank())?;
    }
    if !group.is_first() {
        let mut shape = first.dims().to_vec();
        shape[TIME_DIM] = cache_size;
        let received = group.recv(&shape, first.dtype(), first.device(), group.prev_rank())?;
        debug!("rank {rank}: received boundary {:?} from {}", received.dims(), group.prev_rank());
        context = Some(received);
    }
    Ok(context)
}

/// Hands the end-of-sequence boundary from the last rank to rank 0 so the next
/// streamed call on rank 0 continues where the last shard stopped.
///
/// Returns the tensor rank 0 should keep as its boundary cache; other ranks
/// get `None`. With a single rank the boundary is kept locally.
pub fn pass_stream_memory(
    group: Option<&dyn SequenceParallelGroup>,
    last_input: &Tensor,
    cache_size: usize,
) -> Result<Option<Tensor>> {
    let group = match group {
        Some(group) if group.world_size() > 1 => group,
        _ => return Ok(Some(tail_frames(last_input, cache_size)?)),
    };
    let rank = group.rank();

    if group.is_last() {
        let boundary = tail_frames(last_input, cache_size)?;
        debug!("rank {rank}: send stream memory {:?} to {}", boundary.dims(), group.next_rank());
        group.send(&boundary, group.next_rank())?;
    }
    if group.is_first() {
        let mut shape = last_input.dims().to_vec();
        shape[TIME_DIM] = cache_size;
        let memory = group.recv(&shape, last_input.dtype(), last_input.device(), group.prev_rank())?;
        return Ok(Some(memory));
    }
    Ok(None)
}
