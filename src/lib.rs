pub mod capabilities;
pub mod config;
pub mod control;
pub mod filematch;
pub mod jsonrpc;
pub mod lsp;
pub mod mcp;
pub mod nix;
pub mod pool;
pub mod router;
pub mod server;
pub mod transport;
