//! Infrastructure layer for the NearChat node.
//!
//! Contains the components that own background tasks and talk to the radio:
//! the transport session manager, the peer resolver, the radio adapters, and
//! file-system storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `nearchat_core`, but MUST NOT be imported by the `application` layer.  The
//! session manager and the resolver implement the application's
//! `SessionControl` and `PeerDirectory` ports.

pub mod radio;
pub mod resolver;
pub mod session;
pub mod storage;
