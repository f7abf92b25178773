//! Database layer for the binsight backend
//!
//! Schema initialization lives here; query accessors live with the server
//! crate next to the components that own them.

mod init;

pub use init::{connect_memory, create_schema, init_database};
