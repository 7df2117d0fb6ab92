//! Proptest generators for property-based testing.

use proptest::prelude::*;

use karya_sync_core::{AssignmentStatus, ChangeBatch, Record, TableName, Timestamp};

/// Generate a timestamp after the epoch and before 2100.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    (1i64..4_102_444_800_000).prop_map(Timestamp::from_millis)
}

/// Generate a record id.
pub fn record_id() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}(-[a-z0-9]{1,8})?".prop_map(String::from)
}

/// Generate one of the registered table names.
pub fn table_name() -> impl Strategy<Value = TableName> {
    prop_oneof![
        Just(TableName::WORKER),
        Just(TableName::TASK),
        Just(TableName::MICROTASK_GROUP),
        Just(TableName::MICROTASK),
        Just(TableName::MICROTASK_GROUP_ASSIGNMENT),
        Just(TableName::MICROTASK_ASSIGNMENT),
    ]
}

/// Generate an AssignmentStatus.
pub fn assignment_status() -> impl Strategy<Value = AssignmentStatus> {
    prop_oneof![
        Just(AssignmentStatus::Assigned),
        Just(AssignmentStatus::Completed),
        Just(AssignmentStatus::Submitted),
        Just(AssignmentStatus::Verified),
        Just(AssignmentStatus::Skipped),
        Just(AssignmentStatus::Expired),
    ]
}

/// Generate a row with a few free-form columns.
pub fn record() -> impl Strategy<Value = Record> {
    (record_id(), timestamp(), "[ -~]{0,24}", any::<i32>(), any::<bool>()).prop_map(
        |(id, at, text, n, flag)| {
            Record::new(id, at)
                .with("text", text)
                .with("n", n)
                .with("flag", flag)
        },
    )
}

/// Generate an assignment row with a valid status.
pub fn assignment_record() -> impl Strategy<Value = Record> {
    (record_id(), timestamp(), assignment_status()).prop_map(|(id, at, status)| {
        Record::new(id, at)
            .with("microtask_id", "m-1")
            .with("worker_id", "w-1")
            .with("status", status.as_str())
    })
}

/// Generate a batch of up to `max_rows` rows for one table.
pub fn change_batch(max_rows: usize) -> impl Strategy<Value = ChangeBatch> {
    (table_name(), prop::collection::vec(record(), 0..=max_rows))
        .prop_map(|(table, rows)| ChangeBatch::new(table, rows))
}

/// Generate attachment contents of at most `max_len` bytes.
pub fn file_contents(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}
