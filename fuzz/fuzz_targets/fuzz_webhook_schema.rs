//! Fuzz the webhook body parser and resource path parser.
//!
//! Both run on attacker-controlled bytes before any authentication result is
//! acted on, so neither may panic on any input.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_webhook_schema -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use meli_webhook_gateway::models::Topic;
use meli_webhook_gateway::services::ResourceRef;
use meli_webhook_gateway::validation::parse_notification;

fuzz_target!(|data: &[u8]| {
    let _ = parse_notification(data, None);
    let _ = parse_notification(data, Some("app123"));

    if let Ok(s) = std::str::from_utf8(data) {
        for topic in Topic::ALL {
            let _ = ResourceRef::parse(topic, s, 1);
        }
    }
});
