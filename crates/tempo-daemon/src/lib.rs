//! The tempo daemon: the background reconciler, the HTTP API, and the
//! process wiring that connects them to the store and the LLM client.

pub mod daemon;
pub mod http_api;
pub mod logging;
pub mod reconciler;
pub mod shutdown;
