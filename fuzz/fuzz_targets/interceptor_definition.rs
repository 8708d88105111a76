//! Fuzz target for interceptor definition strings.
//!
//! Parsing must never panic. Every definition that parses must also be
//! accepted or cleanly rejected by the factory.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sqlpool_interceptor::{InterceptorDefinition, InterceptorFactory};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(definitions) = InterceptorDefinition::parse_list(input) else {
        return;
    };

    for def in &definitions {
        assert!(!def.name.is_empty());
        assert!(!def.short_name().is_empty());
        for (key, _) in def.properties.iter() {
            assert!(!key.is_empty());
        }
    }

    let _ = InterceptorFactory::new().build_chain(&definitions);
});
