//! Service handlers, one module per service.

pub mod admin;
pub mod endpoint;
