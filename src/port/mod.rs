//! Port abstraction layer.
//!
//! Provides the [`Port`] trait, the health model, buffered reader/writer
//! workers, the fan-out and BLE chunking building blocks, and the teardown
//! guard they all share.

pub mod aggregate;
pub mod chunked;
pub mod error;
pub mod mock;
pub mod reader;
pub mod state;
pub mod stream;
pub mod stream_port;
pub mod teardown;
pub mod traits;
pub mod writer;

pub use aggregate::AggregatingPort;
pub use chunked::{ChunkedFlowBuffer, FlowConfig, GattCharacteristic, DEFAULT_CHUNK_SIZE};
pub use error::PortError;
pub use mock::MockStream;
pub use reader::{BufferedReader, ReaderEnd};
pub use state::{HealthState, InputListener, ListenerSlot, PortListener, StateCell};
pub use stream::{ByteSink, ByteSource, IoSink, IoSource, LineControl, StreamPair};
pub use stream_port::StreamPort;
pub use teardown::{SafeTeardown, TeardownGuard};
pub use traits::{Port, PortOptions};
pub use writer::{BufferedWriter, WriterConfig};
