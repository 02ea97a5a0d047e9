//! Fuzz target for envelope field extraction.
//!
//! Anything can arrive on a stream; none of it may panic the reader.

#![no_main]

use cdc_replay_engine::event::{
    extract_aggregate_id, extract_aggregate_type, extract_operation, extract_source, is_snapshot_event,
    EventMessage,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data).into_owned();

    let _ = extract_aggregate_id(&raw);
    let _ = extract_aggregate_type(&raw);
    let _ = extract_operation(&raw);
    let _ = extract_source(&raw);
    let _ = is_snapshot_event(&raw);

    let event = EventMessage::new(raw);
    let _ = event.entity_type();
    let _ = event.operation();
    let _ = event.is_last_snapshot();
    let _ = event.field("customer_id");
    assert_eq!(event.unique_identifier().len(), 64);
});
