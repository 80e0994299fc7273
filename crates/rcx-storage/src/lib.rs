//! rcx-storage: OpenDAL operators and the chunk transport built on them

pub mod operator;
pub mod transport;

pub use operator::{build_operator, Credentials};
pub use transport::{ChunkTransport, OperatorTransport, TransportError};
