//! Test doubles for the remote httpreq endpoint and the DNS server it manages.

pub mod dns;
pub mod server;

pub use dns::{
    MockDns,
    TxtRecords,
};
pub use server::MockHttpReqEndpoint;

#[derive(thiserror::Error, Debug)]
pub enum MockError {
    #[error("unable to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server was already closed")]
    AlreadyClosed,
}
