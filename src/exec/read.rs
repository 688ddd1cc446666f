//! Pipelined read path: scan -> filter -> projection -> sort | aggregate,
//! one thread per stage, bounded channels of row batches, shared
//! cancellation.

use log::debug;
use std::collections::{BTreeMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use super::error::{ExecError, ExecResult};
use super::plan::{
    AggFunc, AggregateSpec, CompareOp, Literal, PlanError, Predicate, SelectSpec, SortDirection,
    SortSpec,
};
use super::Engine;
use crate::catalog::ColumnType;
use crate::storage::{decode_row, Row, StorageError, Table};

/// Rows carried in a single inter-stage message. Small enough that
/// cancellation latency is bounded by one batch of work per stage.
pub const BATCH_THRESHOLD: usize = 64;

/// Bounded channel depth, in batches.
const CHANNEL_BOUND: usize = 8;

type Batch = Vec<Row>;

/// Shared cancellation signal for one statement. Stages observe it at
/// their channel boundaries and return `Cancelled`.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A predicate compiled against the filtered column's catalog type.
enum RowTest {
    IntCompare {
        column: String,
        op: CompareOp,
        value: i64,
    },
    StrEquals {
        column: String,
        value: String,
    },
    IntRange {
        column: String,
        low: i64,
        high: i64,
    },
}

impl RowTest {
    fn compile(engine: &Engine, table: &str, predicate: &Predicate) -> ExecResult<Self> {
        match predicate {
            Predicate::Range { column, low, high } => Ok(RowTest::IntRange {
                column: column.clone(),
                low: *low,
                high: *high,
            }),
            Predicate::Compare {
                column,
                op,
                literal,
            } => {
                let catalog = engine.catalog.read().unwrap();
                let column_type = catalog
                    .table(table)?
                    .column(table, column)?
                    .column_type;
                match (column_type, op) {
                    (ColumnType::Int, _) => {
                        let value = match literal {
                            Literal::Int(v) => *v,
                            Literal::Str(s) => {
                                s.parse().map_err(|_| ExecError::NotAnInteger {
                                    column: column.clone(),
                                    value: s.clone(),
                                })?
                            }
                        };
                        Ok(RowTest::IntCompare {
                            column: column.clone(),
                            op: *op,
                            value,
                        })
                    }
                    (_, CompareOp::Equals) => {
                        let value = match literal {
                            Literal::Str(s) => s.clone(),
                            Literal::Int(v) => v.to_string(),
                        };
                        Ok(RowTest::StrEquals {
                            column: column.clone(),
                            value,
                        })
                    }
                    _ => Err(ExecError::Plan(PlanError::UnsupportedOperator(format!(
                        "inequality on non-integer column {}",
                        column
                    )))),
                }
            }
        }
    }

    fn matches(&self, row: &Row) -> ExecResult<bool> {
        match self {
            RowTest::IntCompare { column, op, value } => {
                let v = int_column(row, column)?;
                Ok(match op {
                    CompareOp::GreaterThan => v > *value,
                    CompareOp::LessThan => v < *value,
                    CompareOp::Equals => v == *value,
                })
            }
            RowTest::StrEquals { column, value } => Ok(column_value(row, column)? == value),
            RowTest::IntRange { column, low, high } => {
                let v = int_column(row, column)?;
                Ok(v >= *low && v <= *high)
            }
        }
    }
}

impl Engine {
    /// Run a flattened read plan through the stage pipeline and collect
    /// the final batches.
    pub(crate) fn select(&self, spec: SelectSpec, cancel: &CancelToken) -> ExecResult<Vec<Row>> {
        {
            let catalog = self.catalog.read().unwrap();
            catalog.table(&spec.table)?;
        }
        let table = self.disk.table(&spec.table)?;
        let test = match &spec.predicate {
            Some(predicate) => Some(RowTest::compile(self, &spec.table, predicate)?),
            None => None,
        };
        let projection: Option<HashSet<String>> =
            spec.projection.map(|columns| columns.into_iter().collect());

        let output = thread::scope(|scope| -> ExecResult<Vec<Row>> {
            let mut handles = Vec::new();

            let (scan_tx, mut input) = sync_channel::<Batch>(CHANNEL_BOUND);
            {
                let table = table.clone();
                let cancel = cancel.clone();
                handles.push(scope.spawn(move || self.scan_stage(&table, scan_tx, &cancel)));
            }

            if let Some(test) = test {
                let (tx, rx) = sync_channel(CHANNEL_BOUND);
                let upstream = mem::replace(&mut input, rx);
                let cancel = cancel.clone();
                handles.push(scope.spawn(move || filter_stage(upstream, tx, test, &cancel)));
            }

            if let Some(columns) = projection {
                let (tx, rx) = sync_channel(CHANNEL_BOUND);
                let upstream = mem::replace(&mut input, rx);
                let cancel = cancel.clone();
                handles
                    .push(scope.spawn(move || projection_stage(upstream, tx, columns, &cancel)));
            }

            if let Some(sort) = spec.sort {
                let (tx, rx) = sync_channel(CHANNEL_BOUND);
                let upstream = mem::replace(&mut input, rx);
                let cancel = cancel.clone();
                handles.push(scope.spawn(move || sort_stage(upstream, tx, sort, &cancel)));
            } else if let Some(aggregate) = spec.aggregate {
                let (tx, rx) = sync_channel(CHANNEL_BOUND);
                let upstream = mem::replace(&mut input, rx);
                let cancel = cancel.clone();
                handles
                    .push(scope.spawn(move || aggregate_stage(upstream, tx, aggregate, &cancel)));
            }

            // Drain before joining so no stage is left blocked on a full
            // channel.
            let mut rows = Vec::new();
            while let Ok(batch) = input.recv() {
                rows.extend(batch);
            }

            let mut failure: Option<ExecError> = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        failure.get_or_insert(err);
                    }
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            match failure {
                Some(err) => Err(err),
                None => Ok(rows),
            }
        });

        // Cancellation is never converted into a success.
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        output
    }

    /// Scan pages in file order, decoding live slots in slot-array order.
    /// Rows are copied out under the entry read lock and sent after it is
    /// released.
    fn scan_stage(
        &self,
        table: &Arc<Table>,
        tx: SyncSender<Batch>,
        cancel: &CancelToken,
    ) -> ExecResult<()> {
        debug!("scan start on {}", table.name);
        let mut batch = Vec::with_capacity(BATCH_THRESHOLD);
        for (page_id, _offset) in table.directory.pages_in_file_order() {
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }

            let page_arc = self.fetch_page(&table.name, page_id)?;
            let entry = table
                .directory
                .get(page_id)
                .ok_or(StorageError::PageNotFound(page_id))?;

            let decoded = (|| -> ExecResult<Vec<Row>> {
                let state = entry.read_state();
                let page = page_arc.read().unwrap();
                let mut rows = Vec::with_capacity(state.slots.len());
                for slot in state.slots.iter().filter(|slot| !slot.free) {
                    rows.push(decode_row(page.slot_bytes(slot))?);
                }
                Ok(rows)
            })();
            self.pool.unpin(page_id, false)?;

            for row in decoded? {
                batch.push(row);
                if batch.len() >= BATCH_THRESHOLD {
                    if cancel.is_cancelled() {
                        return Err(ExecError::Cancelled);
                    }
                    if tx.send(mem::take(&mut batch)).is_err() {
                        return Ok(());
                    }
                }
            }
        }

        if !batch.is_empty() {
            let _ = tx.send(batch);
        }
        debug!("scan done on {}", table.name);
        Ok(())
    }
}

fn filter_stage(
    input: Receiver<Batch>,
    tx: SyncSender<Batch>,
    test: RowTest,
    cancel: &CancelToken,
) -> ExecResult<()> {
    let mut matched = Vec::with_capacity(BATCH_THRESHOLD);
    loop {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let Ok(rows) = input.recv() else { break };
        for row in rows {
            if test.matches(&row)? {
                matched.push(row);
                if matched.len() >= BATCH_THRESHOLD
                    && tx.send(mem::take(&mut matched)).is_err()
                {
                    return Ok(());
                }
            }
        }
    }
    if !matched.is_empty() {
        let _ = tx.send(matched);
    }
    Ok(())
}

/// Keep only the projected columns; one output batch per input batch.
fn projection_stage(
    input: Receiver<Batch>,
    tx: SyncSender<Batch>,
    columns: HashSet<String>,
    cancel: &CancelToken,
) -> ExecResult<()> {
    loop {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let Ok(mut rows) = input.recv() else { break };
        for row in &mut rows {
            row.values.retain(|name, _| columns.contains(name));
        }
        if tx.send(rows).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Collect everything, stable-sort on the integer key (ties preserve scan
/// order), apply the limit, emit one batch.
fn sort_stage(
    input: Receiver<Batch>,
    tx: SyncSender<Batch>,
    spec: SortSpec,
    cancel: &CancelToken,
) -> ExecResult<()> {
    let mut rows = Vec::new();
    loop {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let Ok(batch) = input.recv() else { break };
        rows.extend(batch);
    }

    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows {
        let key = int_column(&row, &spec.column)?;
        keyed.push((key, row));
    }
    match spec.direction {
        SortDirection::Asc => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
        SortDirection::Desc => keyed.sort_by(|a, b| b.0.cmp(&a.0)),
    }

    let mut rows: Vec<Row> = keyed.into_iter().map(|(_, row)| row).collect();
    if let Some(limit) = spec.limit {
        rows.truncate(limit);
    }
    let _ = tx.send(rows);
    Ok(())
}

/// Group rows by the group-by column, apply one aggregate function with
/// integer arithmetic, emit one synthesized row of
/// `group_key -> aggregated value` pairs.
fn aggregate_stage(
    input: Receiver<Batch>,
    tx: SyncSender<Batch>,
    spec: AggregateSpec,
    cancel: &CancelToken,
) -> ExecResult<()> {
    let mut groups: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    loop {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let Ok(batch) = input.recv() else { break };
        for row in batch {
            let key = column_value(&row, &spec.group_by)?.to_string();
            groups.entry(key).or_default().push(row);
        }
    }

    let mut result = Row::new(0);
    for (key, rows) in &groups {
        let value = match spec.function {
            AggFunc::Count => rows.len() as i64,
            function => {
                let column = spec
                    .arg
                    .as_deref()
                    .ok_or_else(|| ExecError::MissingColumn("aggregate argument".to_string()))?;
                let mut values = Vec::with_capacity(rows.len());
                for row in rows {
                    values.push(int_column(row, column)?);
                }
                match function {
                    AggFunc::Sum => values.iter().sum(),
                    AggFunc::Avg => values.iter().sum::<i64>() / values.len() as i64,
                    AggFunc::Min => values.iter().copied().fold(i64::MAX, i64::min),
                    AggFunc::Max => values.iter().copied().fold(i64::MIN, i64::max),
                    AggFunc::Count => unreachable!(),
                }
            }
        };
        result.values.insert(key.clone(), value.to_string());
    }

    let _ = tx.send(vec![result]);
    Ok(())
}

fn column_value<'a>(row: &'a Row, column: &str) -> ExecResult<&'a str> {
    row.get(column)
        .ok_or_else(|| ExecError::MissingColumn(column.to_string()))
}

/// Integer comparison semantics: the stored string parsed as a signed
/// 64-bit integer.
fn int_column(row: &Row, column: &str) -> ExecResult<i64> {
    let value = column_value(row, column)?;
    value.parse().map_err(|_| ExecError::NotAnInteger {
        column: column.to_string(),
        value: value.to_string(),
    })
}
