//! Control RPC Server (C10): mutually-authenticated TLS, length-prefixed
//! binary RPC, dispatching to the rest of the control plane (§4.10).

mod codec;
mod server;

pub use codec::{Request, Response, ResponseValue, StaticContentItem};
pub use server::{RpcServer, build_server_tls_config};
