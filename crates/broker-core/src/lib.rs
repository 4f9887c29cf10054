//! Session/Terminal/Registry domain model for the terminal rendezvous
//! broker. No networking lives here; the transport crate drives these
//! types from RPC handlers.

pub mod error;
pub mod registry;
pub mod session;
pub mod terminal;

pub use error::{Error, Result};
pub use registry::Registry;
pub use session::{Dimensions, Session};
pub use terminal::Terminal;
