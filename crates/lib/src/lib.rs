//! Kiot core library: a client gateway to a Kuzzle IoT server over one persistent
//! WebSocket, plus the device facade and configuration used by the CLI.

pub mod config;
pub mod device;
pub mod gateway;
pub mod retry;
