// Record dispatch
//
// Routes a decoded frame's records into the jobs registered for its
// table and folds the survivors into the working pending state. The
// caller owns the ack-then-commit protocol; dispatch only mutates the
// working copy it is handed.

use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tallystream_core::filter::matches;
use tallystream_core::record::{as_num, value_to_string};
use tallystream_core::{Frame, FuncRegistry, JobDefinition, TimedRecord};
use tracing::debug;

use crate::pending::{JobMark, PendingState};
use crate::registry::TaskRegistry;

/// App/table routing from a tag. The last segment is the table, the
/// one before it the app; a bare table gets the `default` app.
///
/// `xd.game.hsqj.consume` -> (`hsqj`, `consume`); `consume` ->
/// (`default`, `consume`).
pub fn split_tag(tag: &str) -> (&str, &str) {
    match tag.rsplit_once('.') {
        Some((head, table)) => {
            let app = head.rsplit('.').next().unwrap_or(head);
            (app, table)
        }
        None => ("default", tag),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchReport {
    pub records: usize,
    pub jobs_matched: usize,
}

/// Fold one frame into the working state. `now` stamps the per-minute
/// dispatch counters, not the records; record time comes off the wire.
pub fn dispatch_frame(
    frame: &Frame,
    registry: &TaskRegistry,
    funcs: &FuncRegistry,
    state: &mut PendingState,
    now: DateTime<Utc>,
) -> DispatchReport {
    let (app, table) = split_tag(&frame.tag);

    let Some(jobs) = registry.jobs_for(table) else {
        return DispatchReport {
            records: frame.records.len(),
            jobs_matched: 0,
        };
    };

    let minute_key = now.format("%Y-%m-%d,%H:%M").to_string();
    let mut jobs_matched = 0;

    for job in jobs.values() {
        if !job.accepts_app(app) {
            continue;
        }
        jobs_matched += 1;

        let begin = Instant::now();
        for record in &frame.records {
            fold_record(job, app, table, record, funcs, state);
        }

        // Counted per dispatched batch whether or not the filter let
        // anything through.
        let slot = state
            .counter
            .entry(job.key.clone())
            .or_default()
            .entry(minute_key.clone())
            .or_default();
        slot.records += frame.records.len() as u64;
        slot.elapsed_us += begin.elapsed().as_micros() as u64;
    }

    counter!("ingest.records", frame.records.len() as u64);
    debug!(
        tag = %frame.tag,
        records = frame.records.len(),
        jobs = jobs_matched,
        "frame dispatched"
    );

    DispatchReport {
        records: frame.records.len(),
        jobs_matched,
    }
}

fn fold_record(
    job: &JobDefinition,
    app: &str,
    table: &str,
    timed: &TimedRecord,
    funcs: &FuncRegistry,
    state: &mut PendingState,
) {
    let record = &timed.record;

    if let Some(cond) = &job.where_filter {
        if !matches(cond, record, funcs) {
            return;
        }
    }

    let bucket_id = job.bucket_id(record, timed.time as i64);
    let key = job.group_key(app, &bucket_id);
    let fun = &job.functions;

    for field in &fun.dist {
        let value = record.get(field).unwrap_or(&Value::Null);
        state
            .dist
            .entry(format!("dist,{key},{field}"))
            .or_default()
            .insert(value_to_string(value));
    }

    // first/last ordering honors a sub-second `microtime` field when
    // the record carries one.
    let accum_time = record
        .get("microtime")
        .and_then(as_num)
        .filter(|t| *t > 0.0)
        .unwrap_or(timed.time);

    let totals = state.total.entry(key.clone()).or_default();
    totals.accumulate(record, fun, accum_time);
    if totals.is_empty() {
        state.total.remove(&key);
    }

    if job.all_field {
        state.value.insert(key.clone(), record.clone());
    } else if !fun.value.is_empty() {
        let snapshot = state.value.entry(key.clone()).or_default();
        for field in &fun.value {
            snapshot.insert(
                field.clone(),
                record.get(field).cloned().unwrap_or(Value::Null),
            );
        }
    }

    state.jobs.insert(
        key,
        JobMark {
            bucket_id,
            time: timed.time,
            app: app.to_string(),
            table: table.to_string(),
            job_id: job.key.clone(),
        },
    );
}
