pub mod timestamp;
pub mod writer;

pub use timestamp::TimestampCache;
pub use writer::{
    AsyncWriter, BufferedWriter, DoubleBufferedWriter, FileWriter, MemoryWriter, OpSink,
    WriteCallback, WriteDone, WriteError,
};
