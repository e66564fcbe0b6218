//! Core Module - collaborator contracts and their data types
//!
//! - `types.rs`: BrowserSession, SessionOptions, UploadReceipt
//! - `traits.rs`: BrowserSessionProvider, FileStore

pub mod traits;
pub mod types;

pub use traits::{BrowserSessionProvider, FileStore};
pub use types::{BrowserSession, SessionOptions, UploadReceipt};
