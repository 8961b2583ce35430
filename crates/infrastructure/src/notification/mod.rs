pub mod webhook;

pub use webhook::{LoggingIpChangeListener, WebhookNotifier};
