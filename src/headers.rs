//! Shared wire vocabulary for the enhttp tunnel protocol.
//!
//! These are the only protocol-specific headers; everything else on the
//! wire is ordinary HTTP handled by the underlying client/server.

/// Virtual connection identifier, required on every POST.
pub const CONN_ID_HEADER: &str = "X-En-Conn-Id";

/// Target `host:port` for the upstream dial. Honored only on the first POST
/// for a given connection id.
pub const ORIGIN_HEADER: &str = "X-Origin";

/// Sticky-routing redirect. Present on a first-POST response, the client
/// rewrites its server URL to this value for all subsequent POSTs.
pub const SERVER_URL_HEADER: &str = "X-Server-URL";

/// Present on a follow-up POST, instructs the server to close the
/// connection's upstream and forget it.
pub const CLOSE_HEADER: &str = "X-En-Close";

/// Chunk size used by both the client's receive pump and the server's
/// upstream pump. Not observable to the peer; purely an implementation
/// detail of how bytes are batched between reads.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Depth of the client's ingress queue between the receive pump and the
/// caller's `Read`. Bounds memory and gives the pump natural backpressure.
pub const INGRESS_QUEUE_DEPTH: usize = 10;
