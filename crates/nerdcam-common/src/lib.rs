//! Nerdcam-Common: Shared types, identifiers, and the relay error taxonomy.
//!
//! This crate provides common functionality used across nerdcam:
//!
//! - **Typed IDs**: Type-safe UUID wrappers for fanout clients and relay sessions
//! - **Core Types**: Upstream transport, liveness state, and relay profile enums
//! - **Error Handling**: The relay error taxonomy and result alias
//!
//! # Examples
//!
//! ```
//! use nerdcam_common::{ClientId, LivenessState, Transport, Error, Result};
//!
//! let client = ClientId::new();
//! assert_eq!(Transport::Udp.to_string(), "udp");
//! assert!(LivenessState::Live.is_serving());
//!
//! fn example() -> Result<()> {
//!     Err(Error::unavailable("upstream refused connection"))
//! }
//! # let _ = client;
//! ```

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
