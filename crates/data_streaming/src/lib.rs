pub mod error;
pub mod sample;
pub mod shard;
mod sharder;
pub mod source;
pub mod stream;
pub mod worker;

pub use error::{is_fatal, log_and_skip_handler, reraise_handler, ErrorHandler, FatalSampleError};
pub use sample::{FieldValue, FromJoined, JoinedParts, KeyPart, Keyed, RawRecord, RecordSample, RestoreKey};
pub use shard::{MemoryShardStore, ShardEntry, ShardInfo, ShardReader, ShardSlice};
pub use source::{Materialize, RawMaterializer, Source, Sources, Utf8Materializer};
pub use stream::joined::{JoinedRecordStream, RecordTuple};
pub use stream::loader::{LoaderMergedState, LoaderState, RecordStream};
pub use stream::map::{MapMergedState, MapState, MapStream, Mapped, StreamTransform};
pub use stream::merge::{JoinMethod, MergeStream};
pub use stream::runner::StreamLoader;
pub use stream::{SavableStream, StreamConfig, StreamConfigBuilder, WorkerIter};
pub use worker::WorkerConfig;
