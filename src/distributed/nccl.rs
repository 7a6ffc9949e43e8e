//! NCCL-based process group
//!
//! One process per GPU. The NCCL unique id is created on rank 0 and handed to
//! the other ranks over a bootstrap group (normally the TCP group), after
//! which every collective runs through NCCL on the rank's own device.
//!
//! # Requirements
//!
//! - CUDA 12.x
//! - NCCL library installed on the system
//! - Compile with `--features nccl`

use candle_core::Result;
use cudarc::driver::{CudaContext, CudaStream};
use cudarc::nccl::{Comm, Id, ReduceOp};
use std::sync::{Arc, Mutex};

use super::group::ProcessGroup;

const NCCL_ID_BYTES: usize = 128;

fn nccl_err<E: std::fmt::Debug>(context: &str, e: E) -> candle_core::Error {
    candle_core::Error::Msg(format!("{}: {:?}", context, e))
}

/// Process group backed by an NCCL communicator
///
/// # Thread Safety
///
/// The communicator is wrapped in a Mutex so that collectives issued from
/// different threads are serialized.
pub struct NcclGroup {
    stream: Arc<CudaStream>,
    comm: Mutex<Comm>,
    rank: usize,
    world_size: usize,
    local_rank: usize,
}

// SAFETY: The Mutex ensures that NCCL operations are serialized
unsafe impl Send for NcclGroup {}
unsafe impl Sync for NcclGroup {}

impl NcclGroup {
    /// Join the NCCL communicator for `bootstrap`'s rank layout, on GPU `local_rank`
    pub fn new(bootstrap: &dyn ProcessGroup) -> Result<Self> {
        let rank = bootstrap.rank();
        let world_size = bootstrap.world_size();
        let local_rank = bootstrap.local_rank();

        // Every byte of the id survives a round trip through f32.
        let mut id_buf = vec![0.0f32; NCCL_ID_BYTES];
        if rank == 0 {
            let id = Id::new().map_err(|e| nccl_err("Failed to create NCCL id", e))?;
            for (slot, byte) in id_buf.iter_mut().zip(id.internal().iter()) {
                *slot = *byte as f32;
            }
        }
        bootstrap.broadcast(&mut id_buf, 0)?;
        let mut internal = [0 as std::ffi::c_char; NCCL_ID_BYTES];
        for (byte, v) in internal.iter_mut().zip(&id_buf) {
            *byte = *v as std::ffi::c_char;
        }
        let id = Id::uninit(internal);

        let stream = CudaContext::new(local_rank)
            .map(|ctx| ctx.default_stream())
            .map_err(|e| nccl_err("Failed to create CUDA context", e))?;
        let comm = Comm::from_rank(stream.clone(), rank, world_size, id)
            .map_err(|e| nccl_err("Failed to create NCCL comm", e))?;

        log::info!(
            "NCCL group initialized: rank {}/{} on GPU {}",
            rank,
            world_size,
            local_rank
        );

        Ok(Self {
            stream,
            comm: Mutex::new(comm),
            rank,
            world_size,
            local_rank,
        })
    }

    fn sum_in_place(&self, buf: &mut [f32]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let comm = self
            .comm
            .lock()
            .map_err(|_| candle_core::Error::Msg("NCCL communicator lock poisoned".to_string()))?;

        let send = self
            .stream
            .clone_htod(buf)
            .map_err(|e| nccl_err("Failed to copy to GPU", e))?;
        let mut recv = self
            .stream
            .alloc_zeros::<f32>(buf.len())
            .map_err(|e| nccl_err("Failed to allocate output", e))?;

        comm.all_reduce(&send, &mut recv, &ReduceOp::Sum)
            .map_err(|e| nccl_err("NCCL all_reduce failed", e))?;

        let result: Vec<f32> = self
            .stream
            .clone_dtoh(&recv)
            .map_err(|e| nccl_err("Failed to copy from GPU", e))?;
        buf.copy_from_slice(&result);
        Ok(())
    }
}

impl ProcessGroup for NcclGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        self.sum_in_place(buf)
    }

    /// Broadcast as a sum where every non-root rank contributes zeros,
    /// which reproduces the root's values exactly.
    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(candle_core::Error::Msg(format!(
                "broadcast root {} out of range for world size {}",
                root, self.world_size
            )));
        }
        if self.rank != root {
            buf.fill(0.0);
        }
        self.sum_in_place(buf)
    }
}
