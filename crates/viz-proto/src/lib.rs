pub mod bands;
pub mod config;
pub mod platform;
pub mod protocol;
pub mod track;

pub use bands::{BandDefinition, BandTable, BandVector, BAND_COUNT};
pub use protocol::Snapshot;
pub use track::TrackState;
