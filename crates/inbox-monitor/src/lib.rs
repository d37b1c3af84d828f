//! Inbox monitoring for a single mail account
//!
//! Polls the provider through the `ApiGate` for unread messages and turns
//! each new one into a notification. Pre-existing unread mail is recorded
//! at start and never notified.
//!
//! Message flow:
//! 1. `Monitor::start()` seeds the known ids with the unread backlog
//! 2. Each tick lists unread messages received since the start, claims the
//!    unseen ids as known before doing anything else with them
//! 3. Each claimed message is fetched and handed to the `Dispatcher`
//! 4. The `Dispatcher` drops senders not in `NotifiableAuthors`, runs the
//!    optional `Enricher` (summary, tone), estimates read time and calls the
//!    `Notifier`
//!
//! Known ids live in memory only; a restart may notify again for mail that
//! is still unread.

pub mod authors;
pub mod dispatch;
pub mod error;
pub mod monitor;

pub use authors::NotifiableAuthors;
pub use dispatch::{
    DispatchOutcome, DispatchSettings, Dispatcher, Enricher, Notification, Notifier, ReadTime,
    ToneScore, Urgency, estimate_read_time,
};
pub use error::{AuthorsError, DispatchError, MonitorError, Result};
pub use monitor::{Monitor, MonitorConfig, StartOutcome, StopOutcome};
