//! Web layer: routes, page handlers, views and the outbound redirect filter

pub mod filters;
pub mod handlers;
pub mod routes;
pub mod templates;

pub use routes::create_router;
