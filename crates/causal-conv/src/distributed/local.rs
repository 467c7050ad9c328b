//! In-process sequence-parallel group backed by channels, one per ordered
//! pair of ranks. Each member is meant to live on its own thread.

use std::sync::mpsc::{channel, Receiver, Sender};

use candle_core::{DType, Device, Tensor};

use super::SequenceParallelGroup;
use crate::errors::{ConvError, Result};

pub struct ChannelRank {
    rank: usize,
    world_size: usize,
    senders: Vec<Option<Sender<Tensor>>>,
    receivers: Vec<Option<Receiver<Tensor>>>,
}

/// Builds a fully connected group of `world_size` members, ordered by rank.
pub fn channel_group(world_size: usize) -> Vec<ChannelRank> {
    let mut members = (0..world_size)
        .map(|rank| ChannelRank {
            rank,
            world_size,
            senders: (0..world_size).map(|_| None).collect(),
            receivers: (0..world_size).map(|_| None).collect(),
        })
        .collect::<Vec<_>>();
    for src in 0..world_size {
        for dst in 0..world_size {
            if src == dst {
                continue;
            }
            let (tx, rx) = channel();
            members[src].senders[dst] = Some(tx);
            members[dst].receivers[src] = Some(rx);
        }
    }
    members
}

impl SequenceParallelGroup for ChannelRank {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, tensor: &Tensor, dst: usize) -> Result<()> {
        let sender = self
            .senders
            .get(dst)
            .and_then(Option::as_ref)
            .ok_or_else(|| ConvError::communication(format!("rank {} has no link to {dst}", self.rank)))?;
        sender
            .send(tensor.clone())
            .map_err(|_| ConvError::communication(format!("rank {dst} hung up")))
    }

    fn recv(&self, shape: &[usize], dtype: DType, device: &Device, src: usize) -> Result<Tensor> {
        let receiver = self
            .receivers
            .get(src)
            .and_then(Option::as_ref)
            .ok_or_else(|| ConvError::communication(format!("rank {} has no link from {src}", self.rank)))?;
        let tensor = receiver
            .recv()
            .map_err(|_| ConvError::communication(format!("rank {src} hung up")))?;
        if tensor.dims() != shape {
            return Err(ConvError::communication(format!(
                "rank {} expected {shape:?} from {src}, got {:?}",
                self.rank,
                tensor.dims()
            )));
        }
        Ok(tensor.to_device(device)?.to_dtype(dtype)?)
    }
}
