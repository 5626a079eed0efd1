//! Wire protocol: frame I/O, header parsing, and typed frame readers.

pub mod codec;
pub mod frame;
pub mod header;

pub use codec::FrameCursor;
pub use frame::{read_message, write_message, Frame};
pub use header::{Header, Opcode};
