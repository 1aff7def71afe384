// Conversion between the in-memory table/log and the persisted state
use crate::error::{Result, SplitError};
use crate::handles::{BindingState, Category, HandleTable, VirtualHandle, CATEGORY_COUNT};
use crate::proto::{arg_entry, ArgEntry, HandleEntry, RecordEntry, StateImage};
use crate::record::{Arg, CallLog, LogRecord};

pub const IMAGE_VERSION: u32 = 1;

/// Capture the virtual side of the table and the whole log. Real handles
/// and predefined bindings are never written.
pub fn to_image(table: &HandleTable, log: &CallLog) -> StateImage {
    let handles = table
        .entries()
        .into_iter()
        .filter(|(h, _)| !HandleTable::is_predefined(*h))
        .map(|(h, b)| HandleEntry {
            handle: h.raw(),
            tombstoned: b.state == BindingState::Tombstoned,
        })
        .collect();

    let records = log
        .iter()
        .into_iter()
        .map(|r| RecordEntry {
            seq: r.seq,
            category: r.category.tag(),
            op: r.op.clone(),
            args: r
                .args
                .iter()
                .map(|a| ArgEntry {
                    value: Some(match a {
                        Arg::Int(v) => arg_entry::Value::Int(*v),
                        Arg::Handle(h) => arg_entry::Value::Handle(h.raw()),
                        Arg::Buf(b) => arg_entry::Value::Buf(b.clone()),
                    }),
                })
                .collect(),
            output: r.output.map(VirtualHandle::raw),
            collective: r.collective,
        })
        .collect();

    StateImage {
        version: IMAGE_VERSION,
        handles,
        next_serials: table.next_serials().to_vec(),
        next_seq: log.next_seq(),
        records,
    }
}

fn invalid(reason: String) -> SplitError {
    SplitError::InvalidImage { reason }
}

fn handle(raw: u32) -> Result<VirtualHandle> {
    let h = VirtualHandle::from_raw(raw);
    if h.category().is_none() || h.serial() == 0 {
        return Err(invalid(format!("0x{:08x} is not a virtual handle", raw)));
    }
    Ok(h)
}

/// Rebuild a table (all bindings unbound) and a log from persisted state.
pub fn from_image(state: &StateImage) -> Result<(HandleTable, CallLog)> {
    if state.version != IMAGE_VERSION {
        return Err(invalid(format!("unsupported state version {}", state.version)));
    }
    if state.next_serials.len() != CATEGORY_COUNT {
        return Err(invalid(format!(
            "{} serial counters, expected {}",
            state.next_serials.len(),
            CATEGORY_COUNT
        )));
    }
    let mut next_serials = [0u32; CATEGORY_COUNT];
    next_serials.copy_from_slice(&state.next_serials);

    let mut entries = Vec::with_capacity(state.handles.len());
    for e in &state.handles {
        let h = handle(e.handle)?;
        if h.serial() >= next_serials[h.category().map(Category::index).unwrap_or(0)] {
            return Err(invalid(format!("{} was never issued", h)));
        }
        let st = if e.tombstoned {
            BindingState::Tombstoned
        } else {
            BindingState::Live
        };
        entries.push((h, st));
    }
    let table = HandleTable::from_parts(entries, next_serials)?;

    let mut records = Vec::with_capacity(state.records.len());
    for r in &state.records {
        let category = Category::from_tag(r.category)
            .ok_or_else(|| invalid(format!("record {} has unknown category {}", r.seq, r.category)))?;
        let mut args = Vec::with_capacity(r.args.len());
        for a in &r.args {
            args.push(match &a.value {
                Some(arg_entry::Value::Int(v)) => Arg::Int(*v),
                Some(arg_entry::Value::Handle(h)) => Arg::Handle(handle(*h)?),
                Some(arg_entry::Value::Buf(b)) => Arg::Buf(b.clone()),
                None => return Err(invalid(format!("record {} has an empty argument", r.seq))),
            });
        }
        records.push(LogRecord {
            seq: r.seq,
            category,
            op: r.op.clone(),
            args,
            output: r.output.map(handle).transpose()?,
            collective: r.collective,
        });
    }
    let log = CallLog::from_parts(records, state.next_seq)?;

    Ok((table, log))
}

/// Log the persisted state for inspection
pub fn display(state: &StateImage) {
    log::info!("State image v{}", state.version);
    log::info!("  Next serials: {:?}", state.next_serials);
    log::info!("  Next sequence: {}", state.next_seq);
    log::info!("Handles ({}):", state.handles.len());
    for e in &state.handles {
        log::info!(
            "  {}{}",
            VirtualHandle::from_raw(e.handle),
            if e.tombstoned { " (released)" } else { "" }
        );
    }
    log::info!("Call log ({} records):", state.records.len());
    for r in &state.records {
        let args: Vec<String> = r
            .args
            .iter()
            .map(|a| match &a.value {
                Some(arg_entry::Value::Int(v)) => v.to_string(),
                Some(arg_entry::Value::Handle(h)) => VirtualHandle::from_raw(*h).to_string(),
                Some(arg_entry::Value::Buf(b)) => format!("<{} bytes>", b.len()),
                None => "?".to_string(),
            })
            .collect();
        let out = r
            .output
            .map(|h| format!(" -> {}", VirtualHandle::from_raw(h)))
            .unwrap_or_default();
        let collective = if r.collective { " [collective]" } else { "" };
        log::info!("  #{:<4} {}({}){}{}", r.seq, r.op, args.join(", "), out, collective);
    }
}
