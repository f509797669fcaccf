//! devlabo-gateway: HTTP front door for sandbox instances.
//!
//! `/connect/{user}/{project}/{module}/...` acquires (or cold-starts) the project's instance,
//! serves the reserved `api/*` endpoints from it and reverse-proxies everything else to the
//! module's dev server, WebSocket upgrades included.

pub mod error;
pub mod files;
pub mod handlers;
pub mod proxy;
pub mod router;
pub mod websocket;

pub use error::ApiError;
pub use router::{build_app, AppState};
