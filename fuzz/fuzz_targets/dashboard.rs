//! Fuzz the dashboard extractor.
//!
//! Arbitrary markup plus arbitrary configured selectors must either yield a
//! finite reading or a `DataParse` error, never a panic.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use waterscope_unix_common::dashboard::{extract_dashboard, parse_number, reading_strategies};
use waterscope_unix_common::WaterscopeError;

#[derive(Debug, Arbitrary)]
struct FInput {
    html: String,
    selectors: Vec<String>,
    number: String,
}

fuzz_target!(|input: FInput| {
    if let Some(v) = parse_number(&input.number) {
        assert!(v.is_finite());
    }

    let strategies = reading_strategies(&input.selectors);
    match extract_dashboard(&input.html, &strategies) {
        Ok(data) => assert!(data.reading.value.is_finite()),
        Err(WaterscopeError::DataParse(_)) => {}
        Err(e) => panic!("unexpected error kind: {}", e),
    }
});
