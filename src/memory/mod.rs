//! Pool allocation and the series engine
pub mod heap;
pub mod pool;
pub mod segment;
pub mod series;
pub mod system;

pub use heap::{Heap, HeapStats, RecycleReport, SeriesError, SeriesMetrics, MAX_SERIES_BYTES};
pub use series::{Element, SeriesFlags, SeriesId};
