//! Domain entities for NearChat.
//!
//! Pure data types with no transport dependencies.  They are shared by the
//! session manager, the peer resolver, the dispatcher, and whatever front end
//! consumes the event stream.

/// Events reported upward by the node components.
pub mod events;

/// Connection state machine values, peer records, and send requests.
pub mod state;
