//! HTTP server: shared state, probes and the router.

pub mod health;
pub mod routes;
pub mod state;

pub use health::{PostgresProbe, RedisProbe};
pub use routes::build_router;
pub use state::AppState;
