mod auth;
mod client;
mod config;
mod protocol;
mod server;

pub use auth::{authorize, resolve_request_path};
pub use client::submit;
pub use config::{ServiceConfig, CONFIG_FILE_NAME};
pub use protocol::{ResultMessage, ServerMessage, WireRequest};
pub use server::InstallerService;
