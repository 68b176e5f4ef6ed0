//! Example MapReduce applications.

mod filter;
mod word_count;

pub use filter::PrefixFilter;
pub use word_count::WordCount;
