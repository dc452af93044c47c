//! Mail relay: keyword-routed email forwarding.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod worker;
