//! Fuzz target for stream ID comparison and the commit frontier.
//!
//! Comparison must never panic and must stay antisymmetric; the frontier
//! must never commit an id it was not given.

#![no_main]

use cdc_replay_engine::event::StreamPosition;
use cdc_replay_engine::stream::{compare_stream_ids, parse_stream_id_timestamp, StreamFrontier};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str, Vec<bool>)| {
    let (a, b, done) = data;

    let ab = compare_stream_ids(a, b);
    let ba = compare_stream_ids(b, a);
    assert_eq!(ab, ba.reverse());
    let _ = parse_stream_id_timestamp(a);

    let mut frontier = StreamFrontier::new();
    let ids: Vec<String> = (0..done.len()).map(|i| format!("{}-{}", i, a.len())).collect();
    for id in &ids {
        frontier.track(&StreamPosition::new("s", id.clone()));
    }
    for (id, finished) in ids.iter().zip(&done) {
        if *finished {
            frontier.complete(&StreamPosition::new("s", id.clone()));
        }
    }
    for commit in frontier.advance() {
        assert!(ids.contains(&commit.id));
    }
});
