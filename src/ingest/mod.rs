// Ingestion: capture containers on disk and the live datagram channel

pub mod container;
pub mod frame;
pub mod record;
pub mod sampling;
pub mod socket;
pub mod source;
pub mod varint;

pub use container::{ContainerReader, ContainerWriter, ReadOptions};
pub use frame::{FrameDecoder, FrameReader};
pub use record::{FieldDecoder, FieldRecord, LineParser, RawDecoder, RecordDecoder};
pub use sampling::Sampler;
pub use socket::{DatagramListener, DatagramSource, ReplaySource, SocketEvent, SocketRecordAssembler};
pub use source::FileSource;
