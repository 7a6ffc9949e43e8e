//! In-process process group: every rank is a thread
//!
//! All ranks share one rendezvous slot guarded by a `Mutex` and a `Condvar`.
//! The first rank to arrive at a collective opens the slot, later ranks fold
//! their contribution into it, and the last one publishes the result and wakes
//! the others.
//!
//! A rank that issues a collective different from the one in flight poisons
//! the group: every rank waiting on (or later entering) a collective gets an
//! error instead of deadlocking. The same happens when a rank thread exits or
//! panics while the others still expect it.
//!
//! This backend drives `--nproc N` runs and the multi-rank tests.

use candle_core::Result;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::group::{CollectiveCall, CollectiveKind, ProcessGroup};

struct State {
    /// Bumped every time a collective completes
    generation: u64,
    /// Ranks that have joined the collective in flight
    arrived: usize,
    /// Collective in flight, if any rank has opened one
    pending: Option<CollectiveCall>,
    acc: Vec<f32>,
    result: Vec<f32>,
    departed: Vec<bool>,
    failure: Option<String>,
}

struct Shared {
    world_size: usize,
    timeout: Option<Duration>,
    state: Mutex<State>,
    cvar: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| candle_core::Error::Msg("local process group lock poisoned".to_string()))
    }

    fn depart(&self, rank: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.departed[rank] = true;
            self.cvar.notify_all();
        }
    }
}

fn fail(state: &mut State, cvar: &Condvar, reason: String) -> candle_core::Error {
    if state.failure.is_none() {
        state.failure = Some(reason.clone());
    }
    cvar.notify_all();
    candle_core::Error::Msg(reason)
}

/// One rank's handle on a thread-local process group
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create handles for `world_size` ranks; hand one to each thread
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        Self::create_with_timeout(world_size, None)
    }

    /// Like [`LocalGroup::create`], but a collective that is not joined by
    /// every rank within `timeout` fails on all ranks
    pub fn create_with_timeout(world_size: usize, timeout: Option<Duration>) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            world_size,
            timeout,
            state: Mutex::new(State {
                generation: 0,
                arrived: 0,
                pending: None,
                acc: Vec::new(),
                result: Vec::new(),
                departed: vec![false; world_size],
                failure: None,
            }),
            cvar: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn collective(&self, call: CollectiveCall, buf: &mut [f32]) -> Result<()> {
        let shared = &*self.shared;
        let mut state = shared.lock()?;

        if let Some(reason) = &state.failure {
            return Err(candle_core::Error::Msg(reason.clone()));
        }
        if let Some(gone) = state.departed.iter().position(|&d| d) {
            let reason = format!("rank {} left the group before {:?}", gone, call.kind);
            return Err(fail(&mut state, &shared.cvar, reason));
        }
        if let CollectiveKind::Broadcast { root } = call.kind {
            if root >= shared.world_size {
                let reason = format!(
                    "broadcast root {} out of range for world size {}",
                    root, shared.world_size
                );
                return Err(fail(&mut state, &shared.cvar, reason));
            }
        }

        let pending = state.pending;
        match pending {
            None => {
                state.pending = Some(call);
                state.acc.clear();
                state.acc.resize(call.len, 0.0);
            }
            Some(expected) if expected != call => {
                let reason = format!(
                    "collective mismatch on rank {}: group is running {:?}, rank issued {:?}",
                    self.rank, expected, call
                );
                return Err(fail(&mut state, &shared.cvar, reason));
            }
            Some(_) => {}
        }

        match call.kind {
            CollectiveKind::AllReduce | CollectiveKind::Barrier => {
                for (acc, v) in state.acc.iter_mut().zip(buf.iter()) {
                    *acc += *v;
                }
            }
            CollectiveKind::Broadcast { root } => {
                if self.rank == root {
                    state.acc.copy_from_slice(buf);
                }
            }
        }

        state.arrived += 1;
        if state.arrived == shared.world_size {
            let result = std::mem::take(&mut state.acc);
            state.result = result;
            state.arrived = 0;
            state.pending = None;
            state.generation += 1;
            shared.cvar.notify_all();
        } else {
            let generation = state.generation;
            let deadline = shared.timeout.map(|t| Instant::now() + t);

            while state.generation == generation {
                if let Some(reason) = &state.failure {
                    return Err(candle_core::Error::Msg(reason.clone()));
                }
                if let Some(gone) = state.departed.iter().position(|&d| d) {
                    let reason = format!("rank {} left the group during {:?}", gone, call.kind);
                    return Err(fail(&mut state, &shared.cvar, reason));
                }
                state = match deadline {
                    None => shared.cvar.wait(state).map_err(|_| {
                        candle_core::Error::Msg("local process group lock poisoned".to_string())
                    })?,
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            let reason = format!(
                                "{:?} timed out on rank {} ({} of {} ranks arrived)",
                                call.kind, self.rank, state.arrived, shared.world_size
                            );
                            return Err(fail(&mut state, &shared.cvar, reason));
                        }
                        shared
                            .cvar
                            .wait_timeout(state, deadline - now)
                            .map_err(|_| {
                                candle_core::Error::Msg(
                                    "local process group lock poisoned".to_string(),
                                )
                            })?
                            .0
                    }
                };
            }
        }

        buf.copy_from_slice(&state.result);
        Ok(())
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        self.collective(CollectiveCall::all_reduce(buf.len()), buf)
    }

    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()> {
        self.collective(CollectiveCall::broadcast(buf.len(), root), buf)
    }

    fn barrier(&self) -> Result<()> {
        let mut dummy = [0.0f32];
        self.collective(CollectiveCall::barrier(), &mut dummy)
    }
}

struct DepartOnDrop {
    shared: Arc<Shared>,
    rank: usize,
}

impl Drop for DepartOnDrop {
    fn drop(&mut self) {
        self.shared.depart(self.rank);
    }
}

/// Run `body` once per rank, each on its own named thread, and collect the
/// per-rank results in rank order.
///
/// A rank that returns or panics leaves the group, so peers still waiting on
/// it fail instead of hanging.
pub fn run_ranks<R, F>(groups: Vec<LocalGroup>, body: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(LocalGroup) -> R + Sync,
{
    let body = &body;
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(groups.len());
        for group in groups {
            let rank = group.rank;
            let guard = DepartOnDrop {
                shared: Arc::clone(&group.shared),
                rank,
            };
            let spawned = std::thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn_scoped(scope, move || {
                    let _guard = guard;
                    body(group)
                });
            handles.push((rank, spawned));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for (rank, spawned) in handles {
            match spawned {
                Ok(handle) => match handle.join() {
                    Ok(value) => results.push(value),
                    Err(_) => {
                        first_error.get_or_insert_with(|| {
                            candle_core::Error::Msg(format!("rank {} panicked", rank))
                        });
                    }
                },
                Err(e) => {
                    first_error.get_or_insert_with(|| {
                        candle_core::Error::Msg(format!("failed to spawn rank {}: {}", rank, e))
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    })
}
