//! Client-facing HTTP/1.x handling.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, keepalive loop, route match)
//!     → connection.rs (request head, body, response writes)
//!     → request.rs (parse head, request ID, body forms)
//!     → [upstream request relays the backend response]
//!     → response.rs (status line, framing, error pages)
//!     → Send to client
//! ```

pub mod connection;
pub mod request;
pub mod response;
pub mod server;

pub use connection::ClientConnection;
pub use request::{ClientRequest, RequestBody, RequestId};
pub use server::{HttpServer, Runtime};
