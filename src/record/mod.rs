//! Call log
//!
//! Every successful call that creates or mutates a handle is appended here
//! with its arguments expressed in virtual handles. After a restore the log
//! is replayed against the fresh library instance to rebuild equivalent
//! objects (see `replay`).
//!
//! Records are kept per category in call order and carry a process-wide
//! sequence number. They are never mutated; whole records are only dropped
//! by `clear_handle` (categories without dependents) or by `sweep`.

pub mod replay;

pub use replay::{
    replay, Direct, ReplayArgs, ReplayFn, ReplayRegistry, ReplayStats, ReplayTarget,
};

use std::collections::{HashMap, HashSet};

use crate::error::{Result, SplitError};
use crate::handles::{BindingState, Category, HandleTable, VirtualHandle, CATEGORY_COUNT};

/// One recorded argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Int(i64),
    Handle(VirtualHandle),
    /// Contents of an input buffer, captured at call time.
    Buf(Vec<u8>),
}

impl Arg {
    /// Capture a rank list as little-endian `i32`s.
    pub fn ranks(ranks: &[i32]) -> Self {
        Arg::Buf(ranks.iter().flat_map(|r| r.to_le_bytes()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub seq: u64,
    pub category: Category,
    pub op: String,
    pub args: Vec<Arg>,
    /// Handle produced by the call, if any. May be a predefined null
    /// handle when the call legitimately produced nothing.
    pub output: Option<VirtualHandle>,
    /// Every process of the job made this call together. Such records
    /// survive sweeps so all processes replay the same collectives.
    pub collective: bool,
}

impl LogRecord {
    /// Every non-predefined handle the record references, inputs first.
    pub fn touched(&self) -> impl Iterator<Item = VirtualHandle> + '_ {
        self.args
            .iter()
            .filter_map(|a| match a {
                Arg::Handle(h) => Some(*h),
                _ => None,
            })
            .chain(self.output)
            .filter(|h| !HandleTable::is_predefined(*h))
    }

    pub fn touches(&self, handle: VirtualHandle) -> bool {
        self.touched().any(|h| h == handle)
    }

    /// The non-predefined handle this record creates.
    pub fn creates(&self) -> Option<VirtualHandle> {
        self.output.filter(|h| !HandleTable::is_predefined(*h))
    }
}

/// Result of a tombstone sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub records_removed: usize,
    pub bindings_purged: usize,
}

#[derive(Debug)]
pub struct CallLog {
    next_seq: u64,
    per_category: [Vec<LogRecord>; CATEGORY_COUNT],
}

impl Default for CallLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CallLog {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            per_category: Default::default(),
        }
    }

    /// Rebuild a log from persisted records.
    pub fn from_parts(records: Vec<LogRecord>, next_seq: u64) -> Result<Self> {
        let mut log = Self::new();
        let mut seen = HashSet::new();
        let mut records = records;
        records.sort_by_key(|r| r.seq);
        for record in records {
            if record.seq == 0 || record.seq >= next_seq.max(1) || !seen.insert(record.seq) {
                return Err(SplitError::InvalidImage {
                    reason: format!(
                        "log record {} ({}) has an invalid sequence number",
                        record.seq, record.op
                    ),
                });
            }
            log.per_category[record.category.index()].push(record);
        }
        log.next_seq = next_seq.max(1);
        Ok(log)
    }

    /// Append a record. Only called after the call succeeded.
    pub fn record(
        &mut self,
        category: Category,
        op: impl Into<String>,
        args: Vec<Arg>,
        output: Option<VirtualHandle>,
    ) -> u64 {
        self.push(category, op.into(), args, output, false)
    }

    /// Append the record of a collective call.
    pub fn record_collective(
        &mut self,
        category: Category,
        op: impl Into<String>,
        args: Vec<Arg>,
        output: Option<VirtualHandle>,
    ) -> u64 {
        self.push(category, op.into(), args, output, true)
    }

    fn push(
        &mut self,
        category: Category,
        op: String,
        args: Vec<Arg>,
        output: Option<VirtualHandle>,
        collective: bool,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let record = LogRecord {
            seq,
            category,
            op,
            args,
            output,
            collective,
        };
        log::debug!(
            "Recorded #{} {}/{} -> {:?}{}",
            seq,
            category,
            record.op,
            record.output,
            if collective { " (collective)" } else { "" }
        );
        self.per_category[category.index()].push(record);
        seq
    }

    /// Drop every record referencing `handle`. Used for categories whose
    /// objects never serve as dependencies of other objects.
    pub fn clear_handle(&mut self, handle: VirtualHandle) -> usize {
        let mut removed = 0;
        for records in self.per_category.iter_mut() {
            let before = records.len();
            records.retain(|r| !r.touches(handle));
            removed += before - records.len();
        }
        if removed > 0 {
            log::debug!("Cleared {} records of {}", removed, handle);
        }
        removed
    }

    /// Records of one category in call order.
    pub fn records(&self, category: Category) -> &[LogRecord] {
        &self.per_category[category.index()]
    }

    /// All records in sequence order.
    pub fn iter(&self) -> Vec<&LogRecord> {
        let mut all: Vec<&LogRecord> = self.per_category.iter().flatten().collect();
        all.sort_by_key(|r| r.seq);
        all
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.per_category.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge tombstoned handles that nothing live depends on, together
    /// with every record only they needed.
    ///
    /// A handle is needed when it is live, when a collective record
    /// touches it, or when it is an input of the creation record of a
    /// needed handle. Collective records always survive, whatever this
    /// process got back from them. Any other record survives when it
    /// creates a needed handle, or when it creates nothing and every handle
    /// it touches is needed.
    pub fn sweep(&mut self, table: &HandleTable) -> SweepStats {
        let entries = table.entries();

        let mut creators: HashMap<VirtualHandle, Vec<&LogRecord>> = HashMap::new();
        for record in self.per_category.iter().flatten() {
            if let Some(h) = record.creates() {
                creators.entry(h).or_default().push(record);
            }
        }

        let mut needed: HashSet<VirtualHandle> = HashSet::new();
        let mut work: Vec<VirtualHandle> = entries
            .iter()
            .filter(|(h, b)| b.state == BindingState::Live && !HandleTable::is_predefined(*h))
            .map(|(h, _)| *h)
            .collect();
        for record in self.per_category.iter().flatten().filter(|r| r.collective) {
            work.extend(record.touched());
        }
        while let Some(h) = work.pop() {
            if !needed.insert(h) {
                continue;
            }
            for record in creators.get(&h).into_iter().flatten() {
                work.extend(record.touched().filter(|t| *t != h && !needed.contains(t)));
            }
        }

        let keep = |r: &LogRecord| {
            r.collective
                || match r.creates() {
                    Some(h) => needed.contains(&h),
                    None => r.touched().all(|t| needed.contains(&t)),
                }
        };
        let mut stats = SweepStats::default();
        let mut kept: [Vec<LogRecord>; CATEGORY_COUNT] = Default::default();
        for (i, records) in self.per_category.iter().enumerate() {
            for record in records {
                if keep(record) {
                    kept[i].push(record.clone());
                } else {
                    stats.records_removed += 1;
                }
            }
        }
        self.per_category = kept;

        let dead: Vec<VirtualHandle> = entries
            .iter()
            .filter(|(h, b)| b.state == BindingState::Tombstoned && !needed.contains(h))
            .map(|(h, _)| *h)
            .collect();
        stats.bindings_purged = table.purge(dead.iter());

        log::info!(
            "Swept {} tombstoned handles and {} log records",
            stats.bindings_purged,
            stats.records_removed
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::Predefined;

    fn world() -> VirtualHandle {
        Predefined::CommWorld.handle()
    }

    #[test]
    fn test_record_keeps_category_order_and_global_seq() {
        let table = HandleTable::new();
        let mut log = CallLog::new();
        let g = table.allocate(Category::Group).unwrap();
        let c = table.allocate(Category::Comm).unwrap();

        let s1 = log.record(Category::Group, "comm_group", vec![Arg::Handle(world())], Some(g));
        let s2 = log.record(
            Category::Comm,
            "comm_create",
            vec![Arg::Handle(world()), Arg::Handle(g)],
            Some(c),
        );
        let s3 = log.record(Category::Comm, "comm_free", vec![Arg::Handle(c)], None);
        assert!(s1 < s2 && s2 < s3);
        assert_eq!(log.records(Category::Comm).len(), 2);
        assert_eq!(log.records(Category::Comm)[1].op, "comm_free");
        let seqs: Vec<u64> = log.iter().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![s1, s2, s3]);
    }

    #[test]
    fn test_touched_skips_predefined() {
        let table = HandleTable::new();
        let g = table.allocate(Category::Group).unwrap();
        let mut log = CallLog::new();
        log.record(Category::Group, "comm_group", vec![Arg::Handle(world())], Some(g));
        let r = &log.records(Category::Group)[0];
        assert_eq!(r.touched().collect::<Vec<_>>(), vec![g]);
        assert_eq!(r.creates(), Some(g));
    }

    #[test]
    fn test_clear_handle() {
        let table = HandleTable::new();
        let req = table.allocate(Category::Request).unwrap();
        let mut log = CallLog::new();
        log.record(Category::Request, "ibarrier", vec![Arg::Handle(world())], Some(req));
        assert_eq!(log.clear_handle(req), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_ranks_capture() {
        assert_eq!(Arg::ranks(&[1, -1]), Arg::Buf(vec![1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]));
    }

    #[test]
    fn test_sweep_keeps_dependencies_of_live_handles() {
        let table = HandleTable::new();
        let mut log = CallLog::new();

        // g0 = comm_group(world); g1 = incl(g0); c1 = create(world, g1);
        // free g0 and g1. Both are still needed to rebuild c1.
        let g0 = table.allocate(Category::Group).unwrap();
        log.record(Category::Group, "comm_group", vec![Arg::Handle(world())], Some(g0));
        let g1 = table.allocate(Category::Group).unwrap();
        log.record(
            Category::Group,
            "group_incl",
            vec![Arg::Handle(g0), Arg::ranks(&[0])],
            Some(g1),
        );
        let c1 = table.allocate(Category::Comm).unwrap();
        log.record(
            Category::Comm,
            "comm_create",
            vec![Arg::Handle(world()), Arg::Handle(g1)],
            Some(c1),
        );
        log.record(Category::Group, "group_free", vec![Arg::Handle(g0)], None);
        table.release(g0).unwrap();
        log.record(Category::Group, "group_free", vec![Arg::Handle(g1)], None);
        table.release(g1).unwrap();

        // An unrelated group, created and freed.
        let g2 = table.allocate(Category::Group).unwrap();
        log.record(Category::Group, "comm_group", vec![Arg::Handle(world())], Some(g2));
        log.record(Category::Group, "group_free", vec![Arg::Handle(g2)], None);
        table.release(g2).unwrap();

        let stats = log.sweep(&table);
        assert_eq!(stats.bindings_purged, 1);
        assert_eq!(stats.records_removed, 2);
        assert!(table.binding(g2).is_none());
        assert_eq!(table.binding(g1).unwrap().state, BindingState::Tombstoned);
        assert_eq!(log.len(), 5);
        assert!(log.iter().iter().all(|r| !r.touches(g2)));
    }

    #[test]
    fn test_sweep_releases_chain_once_root_is_gone() {
        let table = HandleTable::new();
        let mut log = CallLog::new();
        let g = table.allocate(Category::Group).unwrap();
        log.record(Category::Group, "comm_group", vec![Arg::Handle(world())], Some(g));
        let c = table.allocate(Category::Comm).unwrap();
        log.record(
            Category::Comm,
            "comm_create",
            vec![Arg::Handle(world()), Arg::Handle(g)],
            Some(c),
        );
        table.release(g).unwrap();
        table.release(c).unwrap();

        let stats = log.sweep(&table);
        assert_eq!(stats.bindings_purged, 2);
        assert!(log.is_empty());
    }

    /// g0 = comm_group(world); g1 = incl(g0); c = create(world, g1) as a
    /// collective, then free g0 and g1.
    fn collective_create(
        log: &mut CallLog,
        table: &HandleTable,
        output: VirtualHandle,
    ) -> (VirtualHandle, VirtualHandle) {
        let g0 = table.allocate(Category::Group).unwrap();
        log.record(Category::Group, "comm_group", vec![Arg::Handle(world())], Some(g0));
        let g1 = table.allocate(Category::Group).unwrap();
        log.record(
            Category::Group,
            "group_incl",
            vec![Arg::Handle(g0), Arg::ranks(&[0, 1, 2])],
            Some(g1),
        );
        log.record_collective(
            Category::Comm,
            "comm_create",
            vec![Arg::Handle(world()), Arg::Handle(g1)],
            Some(output),
        );
        log.record(Category::Group, "group_free", vec![Arg::Handle(g0)], None);
        table.release(g0).unwrap();
        log.record(Category::Group, "group_free", vec![Arg::Handle(g1)], None);
        table.release(g1).unwrap();
        (g0, g1)
    }

    #[test]
    fn test_sweep_keeps_collective_with_null_output() {
        let table = HandleTable::new();
        let mut log = CallLog::new();
        let (g0, g1) = collective_create(&mut log, &table, Predefined::CommNull.handle());

        let stats = log.sweep(&table);
        assert_eq!(stats, SweepStats::default());
        assert_eq!(log.len(), 5);
        assert_eq!(table.binding(g0).unwrap().state, BindingState::Tombstoned);
        assert_eq!(table.binding(g1).unwrap().state, BindingState::Tombstoned);
        let create = &log.records(Category::Comm)[0];
        assert!(create.collective);
        assert_eq!(create.output, Some(Predefined::CommNull.handle()));
    }

    #[test]
    fn test_sweep_outcome_does_not_depend_on_collective_result() {
        // A member gets a communicator and frees it, a non-member gets
        // COMM_NULL. Both must keep the same collective records.
        let member_table = HandleTable::new();
        let mut member = CallLog::new();
        let c = member_table.allocate(Category::Comm).unwrap();
        collective_create(&mut member, &member_table, c);
        member.record(Category::Comm, "comm_free", vec![Arg::Handle(c)], None);
        member_table.release(c).unwrap();

        let other_table = HandleTable::new();
        let mut other = CallLog::new();
        collective_create(&mut other, &other_table, Predefined::CommNull.handle());

        member.sweep(&member_table);
        other.sweep(&other_table);
        let collectives = |log: &CallLog| -> Vec<(u64, String)> {
            log.iter()
                .into_iter()
                .filter(|r| r.collective)
                .map(|r| (r.seq, r.op.clone()))
                .collect()
        };
        assert_eq!(collectives(&member), vec![(3, "comm_create".to_string())]);
        assert_eq!(collectives(&member), collectives(&other));
        // Inputs of the collective stay rebuildable on both sides.
        assert_eq!(member.records(Category::Group).len(), 4);
        assert_eq!(other.records(Category::Group).len(), 4);
    }

    #[test]
    fn test_from_parts_rejects_duplicate_seq() {
        let r = LogRecord {
            seq: 1,
            category: Category::Group,
            op: "comm_group".into(),
            args: vec![],
            output: None,
            collective: false,
        };
        assert!(CallLog::from_parts(vec![r.clone(), r.clone()], 5).is_err());
        let log = CallLog::from_parts(vec![r], 5).unwrap();
        assert_eq!(log.next_seq(), 5);
        assert_eq!(log.len(), 1);
    }
}
