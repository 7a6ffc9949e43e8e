//! Rank-0-only materialization of shared resources
//!
//! Downloads and other setup that write to shared storage must happen once per
//! job. Rank 0 performs them and reads the result; every other rank waits on a
//! barrier and only then reads what rank 0 produced.

use candle_core::Result;

use super::group::ProcessGroup;

/// Materialize a resource on rank 0 and read it on every rank.
///
/// - rank 0: `materialize()`, `read()`, then barrier
/// - others: barrier, then `read()`
///
/// If `materialize` fails on rank 0 the error is returned before the barrier;
/// the other ranks stay blocked until the transport gives up.
pub fn materialize_on_rank_zero<T, M, R>(group: &dyn ProcessGroup, materialize: M, read: R) -> Result<T>
where
    M: FnOnce() -> Result<()>,
    R: FnOnce() -> Result<T>,
{
    if group.is_primary() {
        materialize()?;
        let value = read()?;
        group.barrier()?;
        Ok(value)
    } else {
        group.barrier()?;
        read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::group::SingleProcess;
    use crate::distributed::local::{run_ranks, LocalGroup};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_single_process_materializes_once() {
        let count = AtomicUsize::new(0);
        let value = materialize_on_rank_zero(
            &SingleProcess::default(),
            || {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            || Ok(42),
        )
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exactly_one_rank_materializes() {
        for world_size in 1..=5 {
            let count = AtomicUsize::new(0);
            let materializer = AtomicUsize::new(usize::MAX);
            let results = run_ranks(LocalGroup::create(world_size), |group| {
                materialize_on_rank_zero(
                    &group,
                    || {
                        count.fetch_add(1, Ordering::SeqCst);
                        materializer.store(group.rank(), Ordering::SeqCst);
                        Ok(())
                    },
                    || Ok(group.rank()),
                )
            })
            .unwrap();

            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert_eq!(materializer.load(Ordering::SeqCst), 0);
            for (rank, value) in results.into_iter().enumerate() {
                assert_eq!(value.unwrap(), rank);
            }
        }
    }

    #[test]
    fn test_readers_wait_for_the_barrier() {
        let published = AtomicBool::new(false);
        let results = run_ranks(LocalGroup::create(4), |group| {
            materialize_on_rank_zero(
                &group,
                || {
                    // Slow download: readers must not overtake it.
                    std::thread::sleep(Duration::from_millis(50));
                    published.store(true, Ordering::SeqCst);
                    Ok(())
                },
                || Ok(published.load(Ordering::SeqCst)),
            )
        })
        .unwrap();

        for seen in results {
            assert!(seen.unwrap(), "a rank read before materialization finished");
        }
    }

    #[test]
    fn test_materialize_failure_is_returned_on_rank_zero() {
        let result: Result<()> = materialize_on_rank_zero(
            &SingleProcess::default(),
            || Err(candle_core::Error::Msg("download failed".to_string())),
            || Ok(()),
        );
        assert!(result.unwrap_err().to_string().contains("download failed"));
    }
}
