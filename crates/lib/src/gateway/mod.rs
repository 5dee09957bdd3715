//! Gateway: the HTTP surface of the bot.
//!
//! One port serves the platform webhook (`POST /webhook`) and health checks (`GET /`, `GET /health`).

mod server;

pub use server::{build_services, router, run_gateway, serve, GatewayState};
