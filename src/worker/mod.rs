pub mod symbol_stream;

pub use symbol_stream::{ConnectionPhase, ConnectionState, StreamContext, StreamOptions};
