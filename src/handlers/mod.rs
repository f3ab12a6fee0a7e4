mod health;
mod recovery;
mod security;
mod webhook;

pub use health::{health_check, readiness_check};
pub use recovery::{last_recovery, trigger_recovery};
pub use security::list_security_events;
pub use webhook::{WEBHOOK_PATH, receive_notification, webhook_status};
