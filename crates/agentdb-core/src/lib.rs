pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod flow_token;
pub mod git;
pub mod identity;
pub mod io;
pub mod locator;
pub mod orphan;
pub mod paths;
pub mod phase;
pub mod rules;
pub mod screener;
pub mod store;

pub use error::{Result, SyncError};
