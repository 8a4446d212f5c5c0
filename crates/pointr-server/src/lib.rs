// Library root: the WebSocket front end for pointr sessions. Exposed as a
// library so integration tests can drive the server in-process.

pub mod config;
pub mod protocol;
pub mod ws_server;
