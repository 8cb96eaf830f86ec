use std::error::Error;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array, UInt64Array, UInt8Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use super::{attempt_state_code, request_state_code, LedgerEntry, LedgerEvent};

/// Export ledger entries, one row per entry, for offline auditing.
///
/// `state` holds the target request state for `RequestStateChanged` and the
/// resolved attempt state for `AttemptResolved`; other kinds leave it null.
pub fn write_ledger_parquet<P: AsRef<Path>>(
    path: P,
    entries: &[LedgerEntry],
) -> Result<(), Box<dyn Error>> {
    let mut request_id = Vec::with_capacity(entries.len());
    let mut attempt_seq = Vec::with_capacity(entries.len());
    let mut at_ms = Vec::with_capacity(entries.len());
    let mut kind = Vec::with_capacity(entries.len());
    let mut attempt_id = Vec::with_capacity(entries.len());
    let mut driver_id = Vec::with_capacity(entries.len());
    let mut state = Vec::with_capacity(entries.len());
    let mut deadline_ms = Vec::with_capacity(entries.len());

    for entry in entries {
        request_id.push(entry.request_id.0);
        attempt_seq.push(entry.attempt_seq);
        at_ms.push(entry.at_ms);
        kind.push(entry.event.kind_code());
        let (attempt, driver, code, deadline) = match &entry.event {
            LedgerEvent::RequestSubmitted { .. } | LedgerEvent::RequestRequeued { .. } => {
                (None, None, None, None)
            }
            LedgerEvent::RequestStateChanged { to, .. } => {
                (None, None, Some(request_state_code(*to)), None)
            }
            LedgerEvent::AttemptProposed {
                attempt_id,
                driver_id,
                deadline_ms,
            } => (Some(attempt_id.0), Some(driver_id.0), None, Some(*deadline_ms)),
            LedgerEvent::AttemptResolved {
                attempt_id,
                driver_id,
                state,
            } => (
                Some(attempt_id.0),
                Some(driver_id.0),
                Some(attempt_state_code(*state)),
                None,
            ),
        };
        attempt_id.push(attempt);
        driver_id.push(driver);
        state.push(code);
        deadline_ms.push(deadline);
    }

    let schema = Schema::new(vec![
        Field::new("request_id", DataType::UInt64, false),
        Field::new("attempt_seq", DataType::UInt32, false),
        Field::new("at_ms", DataType::UInt64, false),
        Field::new("kind", DataType::UInt8, false),
        Field::new("attempt_id", DataType::UInt64, true),
        Field::new("driver_id", DataType::UInt64, true),
        Field::new("state", DataType::UInt8, true),
        Field::new("deadline_ms", DataType::UInt64, true),
    ]);

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(request_id)),
        Arc::new(UInt32Array::from(attempt_seq)),
        Arc::new(UInt64Array::from(at_ms)),
        Arc::new(UInt8Array::from(kind)),
        Arc::new(UInt64Array::from(attempt_id)),
        Arc::new(UInt64Array::from(driver_id)),
        Arc::new(UInt8Array::from(state)),
        Arc::new(UInt64Array::from(deadline_ms)),
    ];

    let schema = Arc::new(schema);
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}
