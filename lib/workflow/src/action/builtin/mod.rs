//! Built-in action handlers.
//!
//! One handler per catalog action type. Handlers with side effects publish
//! through the [`Outbox`](crate::outbox::Outbox) keyed by the invocation's
//! idempotency key.

mod alert;
mod condition;
mod external;
mod field;
mod log_entry;
mod notification;
mod template;

pub use alert::CreateAlert;
pub use condition::EvaluateCondition;
pub use external::ExternalRequest;
pub use field::UpdateField;
pub use log_entry::LogEntry;
pub use notification::SendNotification;
