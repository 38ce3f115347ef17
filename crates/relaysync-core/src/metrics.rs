//! Metrics instrumentation for the sync layer.
//!
//! Uses the `metrics` crate facade. The library never installs a recorder;
//! applications pick their own exporter.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const EVENTS_ROUTED: &str = "relaysync_events_routed_total";
    pub const EVENTS_DUPLICATE: &str = "relaysync_events_duplicate_total";
    pub const PROJECTION_UPDATES: &str = "relaysync_projection_updates_total";
    pub const SUBSCRIPTIONS_OPENED: &str = "relaysync_subscriptions_opened_total";
    pub const SUBSCRIPTIONS_REUSED: &str = "relaysync_subscriptions_reused_total";
    pub const SUBSCRIPTIONS_SHED: &str = "relaysync_subscriptions_shed_total";
    pub const SUBSCRIPTIONS_TIMED_OUT: &str = "relaysync_subscriptions_timed_out_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "relaysync_subscriptions_active";
    pub const AUTH_TRANSITIONS: &str = "relaysync_auth_transitions_total";
    pub const FEEDS_ACTIVE: &str = "relaysync_feeds_active";
    pub const ERRORS_TOTAL: &str = "relaysync_errors_total";
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::EVENTS_ROUTED, "Events persisted by the router");
    metrics::describe_counter!(
        names::EVENTS_DUPLICATE,
        "Events absorbed because they were already stored"
    );
    metrics::describe_counter!(names::PROJECTION_UPDATES, "Projection rows written");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_OPENED,
        "Relay-side subscriptions opened"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_REUSED,
        "Listeners attached to an existing subscription"
    );
    metrics::describe_counter!(names::SUBSCRIPTIONS_SHED, "Subscriptions cancelled under load");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TIMED_OUT,
        "Subscriptions that saw no activity before their timeout"
    );
    metrics::describe_gauge!(names::SUBSCRIPTIONS_ACTIVE, "Currently active subscriptions");
    metrics::describe_counter!(names::AUTH_TRANSITIONS, "Relay authentication state changes");
    metrics::describe_gauge!(names::FEEDS_ACTIVE, "Currently subscribed feeds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors surfaced to callers");
}

/// Record a newly stored event.
pub fn record_routed(kind: u32) {
    counter!(names::EVENTS_ROUTED, "kind" => kind.to_string()).increment(1);
}

/// Record an event absorbed as a duplicate.
pub fn record_duplicate() {
    counter!(names::EVENTS_DUPLICATE).increment(1);
}

/// Record a projection write.
pub fn record_projection(projection: &'static str) {
    counter!(names::PROJECTION_UPDATES, "projection" => projection).increment(1);
}

/// Record a new relay-side subscription.
pub fn record_subscription_opened() {
    counter!(names::SUBSCRIPTIONS_OPENED).increment(1);
}

/// Record a listener joining an existing subscription.
pub fn record_subscription_reused() {
    counter!(names::SUBSCRIPTIONS_REUSED).increment(1);
}

/// Record a subscription shed under load.
pub fn record_subscription_shed() {
    counter!(names::SUBSCRIPTIONS_SHED).increment(1);
}

/// Record a subscription activity timeout.
pub fn record_subscription_timeout() {
    counter!(names::SUBSCRIPTIONS_TIMED_OUT).increment(1);
}

/// Update the active subscription count.
pub fn set_active_subscriptions(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(count as f64);
}

/// Record an authentication state change.
pub fn record_auth_transition(to: &'static str) {
    counter!(names::AUTH_TRANSITIONS, "to" => to).increment(1);
}

/// Update the active feed count.
pub fn set_active_feeds(count: usize) {
    gauge!(names::FEEDS_ACTIVE).set(count as f64);
}

/// Record an error delivered to a caller.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => kind).increment(1);
}
