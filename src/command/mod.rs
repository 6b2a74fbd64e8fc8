//! Batch command dispatch to a fleet of phones
//!
//! This module handles:
//! - Splitting the address set into bounded chunks
//! - Running one client task per phone, chunk by chunk
//! - Classifying outcomes and recording them in the store
//! - Draining outstanding store updates and tallying the run

mod dispatcher;

pub use dispatcher::Dispatcher;
