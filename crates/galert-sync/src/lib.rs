//! Alert synchronization: filter matching, the per-alert sync engine,
//! notification hand-off, and the configured pipeline the CLI and scheduler
//! drive.

pub mod config;
pub mod engine;
pub mod matcher;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod webhook;

pub use config::AppConfig;
pub use engine::{
    AlertFailure, AlertSyncOutcome, SyncEngine, SyncError, SyncOptions, SyncRunSummary,
};
pub use matcher::{FilterError, FilterMatcher};
pub use notify::{
    AlertNotification, Delivery, DeliveryStatus, DispatchError, Dispatcher, LogDispatcher,
    NotificationSummary, NotificationTrigger, NotifyOptions,
};
pub use pipeline::{connect_store, migrate, Pipeline, SyncReport};
pub use scheduler::build_scheduler;
pub use webhook::{RetryPolicy, WebhookDispatcher};
