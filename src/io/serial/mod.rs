// src/io/serial/mod.rs
//
// Serial link to the sensor node.
//
// - transport: opens the port, streams raw chunks, services writes
// - framer: reassembles brace-delimited and newline-delimited messages
// - classifier: turns one message into telemetry / device error / text

pub mod classifier;
pub mod framer;
pub mod transport;
pub(crate) mod utils;

pub use classifier::{
    classify, Ccs811Reading, Classified, Dht22Reading, ParsedMessage, SensorReading,
    SystemReading,
};
pub use framer::{BufferStats, FeedResult, MessageFramer, MAX_BUFFER_LEN};
pub use transport::{
    list_serial_ports, SerialPortInfo, SerialTransport, Transport, TransportError,
    TransportEvent,
};
pub use utils::{LineSettings, Parity};
