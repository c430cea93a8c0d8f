//! Pipeline integration tests.
//!
//! Producer, consumers and connection manager running against the
//! in-memory broker with millisecond retry delays:
//! - delayed redelivery and dead-lettering counts
//! - dead-letter notifications
//! - resubscribe after reconnect, exit after abandonment

mod support;
mod reconnect;
mod retries;
