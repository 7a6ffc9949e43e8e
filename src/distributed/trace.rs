//! Collective call recording
//!
//! `TracingGroup` forwards every collective to an inner group and keeps an
//! ordered log of what was issued. Comparing the logs of two ranks is the
//! quickest way to find where their collective sequences diverged.

use candle_core::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::group::{CollectiveCall, CollectiveKind, ProcessGroup};

pub struct TracingGroup {
    inner: Arc<dyn ProcessGroup>,
    calls: Mutex<Vec<CollectiveCall>>,
}

impl TracingGroup {
    pub fn new(inner: Arc<dyn ProcessGroup>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: CollectiveCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    /// Every call issued so far, in order
    pub fn calls(&self) -> Vec<CollectiveCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Count and total element volume per collective kind
    pub fn summary(&self) -> BTreeMap<String, (usize, usize)> {
        let mut out = BTreeMap::new();
        for call in self.calls() {
            let key = match call.kind {
                CollectiveKind::AllReduce => "all_reduce".to_string(),
                CollectiveKind::Broadcast { root } => format!("broadcast(root={})", root),
                CollectiveKind::Barrier => "barrier".to_string(),
            };
            let entry = out.entry(key).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += call.len;
        }
        out
    }

    pub fn log_summary(&self) {
        for (kind, (count, elements)) in self.summary() {
            log::info!(
                "rank {}: {} x {} ({} elements)",
                self.inner.rank(),
                count,
                kind,
                elements
            );
        }
    }
}

impl ProcessGroup for TracingGroup {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn local_rank(&self) -> usize {
        self.inner.local_rank()
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        self.record(CollectiveCall::all_reduce(buf.len()));
        self.inner.all_reduce_sum(buf)
    }

    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()> {
        self.record(CollectiveCall::broadcast(buf.len(), root));
        self.inner.broadcast(buf, root)
    }

    fn barrier(&self) -> Result<()> {
        self.record(CollectiveCall::barrier());
        self.inner.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::group::SingleProcess;

    #[test]
    fn test_records_calls_in_order() {
        let group = TracingGroup::new(Arc::new(SingleProcess::default()));
        let mut buf = [1.0f32; 3];
        group.broadcast(&mut buf, 0).unwrap();
        group.all_reduce_sum(&mut buf).unwrap();
        group.barrier().unwrap();
        group.all_reduce_sum(&mut buf[..1]).unwrap();

        assert_eq!(
            group.calls(),
            vec![
                CollectiveCall::broadcast(3, 0),
                CollectiveCall::all_reduce(3),
                CollectiveCall::barrier(),
                CollectiveCall::all_reduce(1),
            ]
        );
        let summary = group.summary();
        assert_eq!(summary["all_reduce"], (2, 4));
        assert_eq!(summary["barrier"], (1, 1));
    }
}
