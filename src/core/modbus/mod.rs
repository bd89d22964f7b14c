pub mod binary;
pub mod client;
pub mod codec;
pub mod composite;
pub mod emulated;
pub mod error;
pub mod function;
pub mod session;
pub mod transaction;

pub use client::*;
pub use codec::*;
pub use composite::*;
pub use emulated::*;
pub use error::*;
pub use function::*;
pub use session::{ConnectionState, TransportSession};
pub use transaction::*;
