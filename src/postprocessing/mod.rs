//! Post-processing of finished downloads.
//!
//! A [`Mission`] names an algorithm from the registry, the byte ranges it
//! reads and where the result goes. [`run`] executes it in one of two modes:
//!
//! - **same file**: the sources are windows of the output file itself and
//!   the result is written over them with a
//!   [`CircularFileWriter`](postmux_media::stream::CircularFileWriter)
//! - **separate output**: the result goes to a temporary file next to the
//!   output that replaces it on success
//!
//! Every run first asks the algorithm whether there is anything to do
//! (`test`), then processes. State, progress and write holds are reported
//! through a [`MissionHandle`].

mod algorithms;
mod error;
mod mission;
mod runner;

pub use algorithms::{
    default_track_indexes, Algorithm, AlgorithmOptions, Args, ALGORITHM_M4A_NO_DASH,
    ALGORITHM_MP4_FROM_DASH_MUXER, ALGORITHM_OGG_FROM_WEBM_DEMUXER, ALGORITHM_TTML_CONVERTER,
    ALGORITHM_WEBM_MUXER,
};
pub use error::{Error, ErrorCode, Result};
pub use mission::{Mission, MissionHandle, MissionObserver, MissionState, SourceSpec};
pub use runner::{run, source_windows, RunOutcome, RunSettings};
