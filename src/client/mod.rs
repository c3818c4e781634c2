//! Client side of the tunnel: dials a virtual connection against a
//! tunnel server and exposes it as an ordinary `AsyncRead + AsyncWrite`
//! stream.

mod conn;

pub use conn::{ConnHandle, Dialer, VirtualConn, is_virtual_conn};
