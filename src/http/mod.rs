//! HTTP protocol implementation.
//!
//! A hand-built HTTP/1.1 layer: enough of the protocol for a development
//! proxy, with keep-alive support on locally-served responses.
//!
//! # Architecture
//!
//! - **`connection`**: per-connection state machine driving parse → dispatch → write
//! - **`parser`**: parses incoming HTTP requests from byte buffers
//! - **`request`**: request representation, header helpers, upgrade hint
//! - **`response`**: locally-generated responses with builder pattern
//! - **`writer`**: serializes and writes responses to the client
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatching    │ ← Forwarding engine decides
//!        └──────┬───────────┘
//!               │
//!               ├─ Matched → relayed/tunneled on this socket → Closed
//!               ▼ Delegated
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send static response
//!        └──────┬───────────┘
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod connection;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
