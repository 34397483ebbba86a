mod loopback;
mod producer;
mod queue;
pub mod sample;

pub use loopback::V4L2Output;
pub use producer::{FrameProducer, ProducerConfig};
pub use queue::OutputQueue;
pub use sample::OutgoingSample;

use anyhow::Result;

/// Trait for output destinations
pub trait OutputSink: Send {
    /// Write one dequeued sample to the output
    fn write_sample(&mut self, sample: &OutgoingSample) -> Result<()>;

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);
}
