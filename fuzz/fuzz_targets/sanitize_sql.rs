//! Fuzz target for SQL sanitization and operation extraction.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sqlpool_interceptor::SanitizationConfig;
use sqlpool_interceptor::instrumentation::extract_operation;

#[derive(Debug, Arbitrary)]
struct Input {
    sql: String,
    max_length: u16,
}

fuzz_target!(|input: Input| {
    let config = SanitizationConfig {
        max_length: usize::from(input.max_length),
        ..SanitizationConfig::default()
    };

    // Truncation must respect char boundaries.
    let _ = config.sanitize(&input.sql);
    let _ = extract_operation(&input.sql);
});
