pub mod header;
pub mod index;
pub mod io_stream;
pub mod path;
pub mod archive;
pub mod container;
pub mod codec;
pub mod bank;
pub mod tables;
pub mod export;

pub use header::{ArchiveHeader, FormatError, Version};
pub use index::{ArchiveIndex, Entry};
pub use io_stream::WindowedStream;
pub use archive::{Archive, ArchiveError, ExtractMap, ExtractOptions, ExtractReport};
pub use container::{ContainerBuilder, ContainerError};
pub use codec::{AudioFormat, CodecError, Transcoder};
