use once_cell::sync::Lazy;
use prometheus::{IntCounter, Opts};

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("failed to create {name}: {e}"));
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    counter
}

pub static MESSAGES_APPENDED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_core_messages_appended_total",
        "Messages durably appended to the store",
    )
});

pub static DUPLICATES_SUPPRESSED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_core_duplicates_suppressed_total",
        "Transport/store copies discarded by reconciliation",
    )
});

pub static ENTRIES_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_core_entries_failed_total",
        "Provisional entries that never resolved to a durable message",
    )
});

pub static TYPING_EXPIRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_core_typing_expiries_total",
        "Typing indicators cleared by the expiry timer",
    )
});
