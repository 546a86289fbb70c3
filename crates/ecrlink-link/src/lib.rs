pub mod engine;
pub mod port;
pub mod reader;

pub use engine::{Command, LinkConfig, LinkEngine, ResponseGate};
pub use port::{BytePort, SerialBytePort, SerialConfig};
pub use reader::LinkEvent;
