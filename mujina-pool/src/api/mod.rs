//! HTTP API.
//!
//! Serves the work protocol to miners and read-only views of pool state.
//! Routes live under `/api/v0`; the OpenAPI document is served at
//! `/api-docs/openapi.json` with a Swagger UI at `/swagger-ui`.

mod server;
mod v0;

pub use server::{SharedState, router, serve};
