//! Replay of the call log against a fresh library instance
//!
//! Categories are visited in `Category::REPLAY_ORDER`, each from its cursor
//! in call order. A record may only run once it is the oldest unreplayed
//! record for every non-predefined handle it touches, which keeps
//! cross-category sequences (a group taken from a communicator that is
//! later freed) in their original order. Visiting repeats until the log is
//! exhausted; a pass that runs nothing means the log cannot be satisfied.
//!
//! New real handles are collected in a scratch map and bound into the table
//! only after every record succeeded, so a failed replay leaves the table
//! untouched.
//!
//! Each record runs through a `ReplayTarget`, which lets the runtime wrap
//! every call in its own crossing and keep logging outside of them.

use std::collections::{HashMap, VecDeque};

use super::{Arg, CallLog, LogRecord};
use crate::error::{Result, SplitError};
use crate::handles::{
    BindingState, Category, HandleTable, Predefined, RealHandle, VirtualHandle, CATEGORY_COUNT,
};
use crate::library::{CallResult, CommLibrary, LibStatus};

/// Arguments of a record with handles already translated to the new
/// library instance.
#[derive(Debug)]
pub struct ReplayArgs<'a> {
    args: Vec<Resolved<'a>>,
}

#[derive(Debug)]
enum Resolved<'a> {
    Int(i64),
    Real(RealHandle),
    Buf(&'a [u8]),
}

impl<'a> ReplayArgs<'a> {
    pub fn int(&self, i: usize) -> CallResult<i64> {
        match self.args.get(i) {
            Some(Resolved::Int(v)) => Ok(*v),
            _ => Err(LibStatus::ERR_ARG),
        }
    }

    pub fn real(&self, i: usize) -> CallResult<RealHandle> {
        match self.args.get(i) {
            Some(Resolved::Real(h)) => Ok(*h),
            _ => Err(LibStatus::ERR_ARG),
        }
    }

    pub fn buf(&self, i: usize) -> CallResult<&'a [u8]> {
        match self.args.get(i) {
            Some(Resolved::Buf(b)) => Ok(*b),
            _ => Err(LibStatus::ERR_ARG),
        }
    }

    /// A rank list captured with `Arg::ranks`.
    pub fn ranks(&self, i: usize) -> CallResult<Vec<i32>> {
        let buf = self.buf(i)?;
        if buf.len() % 4 != 0 {
            return Err(LibStatus::ERR_ARG);
        }
        Ok(buf
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Re-executes one recorded operation. Returns the produced real handle
/// for creating operations.
pub type ReplayFn = fn(&mut dyn CommLibrary, &ReplayArgs<'_>) -> CallResult<Option<RealHandle>>;

/// Where replay functions execute.
pub trait ReplayTarget {
    /// Run `f` against the library. The outer error is a failure to reach
    /// the library at all; the inner one is the call's own status.
    fn call(&mut self, f: ReplayFn, args: &ReplayArgs<'_>)
        -> Result<CallResult<Option<RealHandle>>>;
}

/// Calls the library directly, without crossing.
pub struct Direct<'a>(pub &'a mut dyn CommLibrary);

impl ReplayTarget for Direct<'_> {
    fn call(
        &mut self,
        f: ReplayFn,
        args: &ReplayArgs<'_>,
    ) -> Result<CallResult<Option<RealHandle>>> {
        Ok(f(&mut *self.0, args))
    }
}

/// Operation name to replay function.
pub struct ReplayRegistry {
    ops: HashMap<String, ReplayFn>,
}

impl Default for ReplayRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ReplayRegistry {
    pub fn empty() -> Self {
        Self {
            ops: HashMap::new(),
        }
    }

    /// Registry covering every logged wrapper.
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register("comm_group", |lib, a| lib.comm_group(a.real(0)?).map(Some));
        r.register("group_incl", |lib, a| {
            lib.group_incl(a.real(0)?, &a.ranks(1)?).map(Some)
        });
        r.register("group_free", |lib, a| lib.group_free(a.real(0)?).map(|_| None));
        r.register("comm_create", |lib, a| {
            lib.comm_create(a.real(0)?, a.real(1)?).map(Some)
        });
        r.register("comm_dup", |lib, a| lib.comm_dup(a.real(0)?).map(Some));
        r.register("comm_free", |lib, a| lib.comm_free(a.real(0)?).map(|_| None));
        r.register("type_contiguous", |lib, a| {
            let count = i32::try_from(a.int(0)?).map_err(|_| LibStatus::ERR_COUNT)?;
            lib.type_contiguous(count, a.real(1)?).map(Some)
        });
        r.register("type_commit", |lib, a| lib.type_commit(a.real(0)?).map(|_| None));
        r.register("type_free", |lib, a| lib.type_free(a.real(0)?).map(|_| None));
        r.register("ibarrier", |lib, a| lib.ibarrier(a.real(0)?).map(Some));
        r
    }

    pub fn register(&mut self, op: &str, f: ReplayFn) {
        self.ops.insert(op.to_string(), f);
    }

    pub fn get(&self, op: &str) -> Option<ReplayFn> {
        self.ops.get(op).copied()
    }

    pub fn contains(&self, op: &str) -> bool {
        self.ops.contains_key(op)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: usize,
    pub passes: usize,
    pub rebound: usize,
}

/// Transient state of one replay.
struct Session<'l> {
    cursors: [usize; CATEGORY_COUNT],
    /// Unreplayed records touching each handle, oldest first.
    queues: HashMap<VirtualHandle, VecDeque<u64>>,
    scratch: HashMap<VirtualHandle, RealHandle>,
    log: &'l CallLog,
    table: &'l HandleTable,
}

impl<'l> Session<'l> {
    fn new(log: &'l CallLog, table: &'l HandleTable) -> Self {
        let mut queues: HashMap<VirtualHandle, VecDeque<u64>> = HashMap::new();
        for record in log.iter() {
            for h in record.touched() {
                let q = queues.entry(h).or_default();
                if q.back() != Some(&record.seq) {
                    q.push_back(record.seq);
                }
            }
        }
        Self {
            cursors: [0; CATEGORY_COUNT],
            queues,
            scratch: HashMap::new(),
            log,
            table,
        }
    }

    fn eligible(&self, record: &LogRecord) -> bool {
        record
            .touched()
            .all(|h| self.queues.get(&h).and_then(|q| q.front()) == Some(&record.seq))
    }

    fn retire(&mut self, record: &LogRecord) {
        for h in record.touched() {
            if let Some(q) = self.queues.get_mut(&h) {
                if q.front() == Some(&record.seq) {
                    q.pop_front();
                }
            }
        }
    }

    fn done(&self) -> bool {
        Category::REPLAY_ORDER
            .iter()
            .all(|c| self.cursors[c.index()] >= self.log.records(*c).len())
    }

    fn resolve<'r>(&self, record: &'r LogRecord) -> Result<ReplayArgs<'r>> {
        let fail = |reason: String| SplitError::Replay {
            seq: record.seq,
            op: record.op.clone(),
            reason,
        };
        let mut args = Vec::with_capacity(record.args.len());
        for arg in &record.args {
            args.push(match arg {
                Arg::Int(v) => Resolved::Int(*v),
                Arg::Buf(b) => Resolved::Buf(b.as_slice()),
                Arg::Handle(h) => {
                    let real = if HandleTable::is_predefined(*h) {
                        self.table
                            .binding(*h)
                            .and_then(|b| b.real)
                            .ok_or_else(|| fail(format!("predefined {} is not bound", h)))?
                    } else {
                        *self.scratch.get(h).ok_or_else(|| {
                            fail(format!("{} was not reconstructed by any earlier record", h))
                        })?
                    };
                    Resolved::Real(real)
                }
            });
        }
        Ok(ReplayArgs { args })
    }

    fn run(
        &mut self,
        record: &LogRecord,
        target: &mut dyn ReplayTarget,
        registry: &ReplayRegistry,
    ) -> Result<()> {
        let fail = |reason: String| SplitError::Replay {
            seq: record.seq,
            op: record.op.clone(),
            reason,
        };

        let f = registry
            .get(&record.op)
            .ok_or_else(|| fail("no replay function registered".into()))?;
        let args = self.resolve(record)?;
        let produced = target
            .call(f, &args)?
            .map_err(|status| fail(format!("call failed: {}", status)))?;

        let produced_null = match (produced, record.output) {
            (None, _) => true,
            (Some(real), Some(out)) => out
                .category()
                .and_then(Predefined::null_of)
                .and_then(|p| self.table.binding(p.handle()))
                .map(|b| b.real == Some(real))
                .unwrap_or(false),
            (Some(_), None) => false,
        };
        let expected_null = match record.output {
            None => true,
            Some(out) => Predefined::ALL
                .iter()
                .any(|p| p.is_null() && p.handle() == out),
        };
        if produced_null != expected_null {
            return Err(fail(format!(
                "outcome diverged: expected {}, got {}",
                if expected_null { "no object" } else { "an object" },
                if produced_null { "no object" } else { "an object" },
            )));
        }

        if let (Some(out), Some(real)) = (record.creates(), produced) {
            self.scratch.insert(out, real);
        }
        log::debug!("Replayed #{} {} -> {:?}", record.seq, record.op, produced);
        Ok(())
    }
}

/// Rebuild every logged object through `target` and rebind the table.
///
/// The library behind `target` must be freshly initialized and the table's
/// predefined handles bound to it. On error nothing in the table changes.
pub fn replay(
    log: &CallLog,
    table: &HandleTable,
    target: &mut dyn ReplayTarget,
    registry: &ReplayRegistry,
) -> Result<ReplayStats> {
    let mut session = Session::new(log, table);
    let mut stats = ReplayStats::default();

    while !session.done() {
        stats.passes += 1;
        let mut progressed = false;
        for category in Category::REPLAY_ORDER {
            let records = log.records(category);
            while let Some(record) = records.get(session.cursors[category.index()]) {
                if !session.eligible(record) {
                    break;
                }
                if let Err(e) = session.run(record, target, registry) {
                    log::error!("Replay aborted: {}", e);
                    return Err(e);
                }
                session.retire(record);
                session.cursors[category.index()] += 1;
                stats.records += 1;
                progressed = true;
            }
        }
        if !progressed {
            let stuck: Vec<String> = Category::REPLAY_ORDER
                .iter()
                .filter_map(|c| log.records(*c).get(session.cursors[c.index()]))
                .map(|r| format!("#{} {}", r.seq, r.op))
                .collect();
            let first = Category::REPLAY_ORDER
                .iter()
                .filter_map(|c| log.records(*c).get(session.cursors[c.index()]))
                .min_by_key(|r| r.seq);
            let err = SplitError::Replay {
                seq: first.map(|r| r.seq).unwrap_or(0),
                op: first.map(|r| r.op.clone()).unwrap_or_default(),
                reason: format!("no record can make progress (waiting: {})", stuck.join(", ")),
            };
            log::error!("Replay stalled: {}", err);
            return Err(err);
        }
    }

    for (handle, real) in &session.scratch {
        if table.binding(*handle).is_some() {
            table.bind(*handle, *real)?;
            stats.rebound += 1;
        }
    }

    let unbound: Vec<VirtualHandle> = table
        .entries()
        .into_iter()
        .filter(|(h, b)| b.real.is_none() && !HandleTable::is_predefined(*h))
        .filter(|(_, b)| b.state == BindingState::Live)
        .map(|(h, _)| h)
        .collect();
    if !unbound.is_empty() {
        log::warn!(
            "{} live handles have no creation record and stay unbound: {:?}",
            unbound.len(),
            unbound
        );
    }

    log::info!(
        "Replayed {} records in {} passes, rebound {} handles",
        stats.records,
        stats.passes,
        stats.rebound
    );
    Ok(stats)
}
