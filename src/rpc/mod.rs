//! Request/response correlation and inbound message routing.
//!
//! - `pending`: correlation table of outstanding calls.
//! - `dispatch`: the single inbound reader.
//! - `events`: notification fan-out.
//! - `handlers`: agent-initiated request handlers.

pub mod dispatch;
pub mod events;
pub mod handlers;
pub mod pending;

pub use dispatch::{run_dispatch, DispatchContext, DispatchExit};
pub use events::{EventBroadcaster, EventHandler, Notification, SubscriptionId, SUBSCRIBER_QUEUE};
pub use handlers::{request_handler, HandlerResult, RequestHandler, RequestHandlers};
pub use pending::{CorrelationTable, ResponseSlot};
