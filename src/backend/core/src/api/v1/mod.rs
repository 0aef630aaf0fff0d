//! V1 API (current, stable).

pub mod routes;

pub use routes::{v1_router, V1_PREFIX};
