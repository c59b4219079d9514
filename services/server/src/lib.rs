// Millrace server: terminates client connections for the log-structured
// event messaging system. Clients publish documents to channels, subscribe
// with credit-based flow control, and query document binders over one framed
// TCP protocol.

pub mod config;
pub mod connection;
pub mod docs;
pub mod observability;
pub mod protocol;
pub mod query;
pub mod serializer;
pub mod server;
pub mod subscription;

pub use config::ServerConfig;
pub use docs::{DocManager, MemoryDocManager};
pub use query::{QueryInfo, QueryManager};
pub use server::Server;
