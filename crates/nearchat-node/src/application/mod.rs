//! Application layer use cases for the NearChat node.
//!
//! - **`dispatch_message`** – Turns "send this text to the peer called X" into
//!   resolve → connect → write → resume listening, one request at a time in
//!   FIFO order.  It drives the session manager and the peer resolver through
//!   the [`dispatch_message::SessionControl`] and
//!   [`dispatch_message::PeerDirectory`] ports, which the infrastructure
//!   layer implements.

pub mod dispatch_message;
