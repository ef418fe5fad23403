pub mod codec;
pub mod error;
pub mod frame;
pub mod pdu;
pub mod transport;

pub use codec::*;
pub use error::*;
pub use frame::*;
pub use pdu::*;
pub use transport::*;
