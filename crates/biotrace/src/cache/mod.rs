pub mod coupled;
pub mod part;

pub use coupled::{required_bytes, required_words, CachedSignal, InputCache, OutputCache};
pub use part::{sample_count, sample_index, PartSignal, SignalCachePart};
