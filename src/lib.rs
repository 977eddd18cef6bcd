//! Process wrapper around the `duplicity` backup tool.
//!
//! [`core::DuplicityRunner`] builds duplicity command lines from a
//! [`core::JobDescriptor`], runs one subprocess at a time, relays its output
//! and scrapes file listings and collection status into structured data.

pub mod config;
pub mod context;
pub mod core;
pub mod logging;
