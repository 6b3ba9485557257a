// ==== Consumption ====
/// Records pulled from the transport, labelled by stage (apply, aggregate)
pub const RECORDS_RECEIVED: &str = "behavior_records_received_total";

/// Records whose effects were applied for the first time
pub const EVENTS_APPLIED: &str = "behavior_events_applied_total";

/// Records skipped because their message id was already in the ledger
pub const EVENTS_SKIPPED_DUPLICATE: &str = "behavior_events_skipped_duplicate_total";

/// Records dropped or rewound, labelled by stage and reason
pub const EVENTS_FAILED: &str = "behavior_events_failed_total";

/// Records rewound for redelivery
pub const RECORDS_REDELIVERED: &str = "behavior_records_redelivered_total";

/// Partition assignments and revocations, labelled by group and event_type
pub const CONSUMER_REBALANCES: &str = "behavior_consumer_rebalances_total";

/// Events that did not match the action kinds of interest
pub const EVENTS_FILTERED: &str = "behavior_events_filtered_total";

// ==== Windows ====
/// Window counts handed to the ranking store
pub const WINDOWS_EMITTED: &str = "behavior_windows_emitted_total";

/// Ranking writes that failed and were skipped
pub const RANKING_WRITE_FAILURES: &str = "behavior_ranking_write_failures_total";

/// Windows still open when the aggregation loop stopped
pub const WINDOWS_DROPPED_ON_SHUTDOWN: &str = "behavior_windows_dropped_on_shutdown_total";

/// Windows currently held in memory
pub const OPEN_WINDOWS: &str = "behavior_open_windows";

// ==== Producer ====
/// Publishes labelled by outcome (success, failure)
pub const EVENTS_PRODUCED: &str = "behavior_events_produced_total";

/// Time to handle a single record, in milliseconds
pub const RECORD_PROCESSING_MS: &str = "behavior_record_processing_ms";
