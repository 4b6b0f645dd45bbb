//! Timing statistics for benchmark stages.
//!
//! Every execution unit of a stage owns its own [`Statistics`] container while it runs and records
//! the outcome of each operation into it. After the unit has stopped, containers from many units,
//! workers and iterations are folded together with [`Statistics::merge`]. Derived views such as
//! percentiles or throughput are computed on demand from the merged data, see [`representation`].
//!
//! Three accumulator kinds are available, selected through [`StatsKind`]:
//!
//!  - [`StatsKind::Basic`] keeps a fixed-size summary (counts, maximum, running mean and second
//!    moment). Merging combines the moments with the parallel variance formula, which is exact up
//!    to floating point rounding. Percentiles and histograms are not available.
//!  - [`StatsKind::Recording`] keeps every sample. Merging concatenates the samples, so all
//!    representations are exact regardless of merge order.
//!  - [`StatsKind::Sketch`] keeps a [DDSketch](sketches_ddsketch::DDSketch). Quantiles carry a
//!    bounded relative error of 1%; the sketch merge itself is order independent.
//!
//! Request and error counts merge exactly for all kinds.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod error;
mod operation;
pub mod representation;
mod statistics;

pub use error::{StatsError, StatsResult};
pub use operation::{BasicStats, OperationStats, RecordingStats, SketchStats, StatsKind};
pub use representation::Representation;
pub use statistics::Statistics;
