//! Archive rotation and naming policy.

mod policy;

pub use policy::{
    ArchiveClock, ArchiveConfig, ArchiveLayout, ArchivePolicy, DEFAULT_ROTATION_PERIOD_SEC,
    MAX_ROTATION_PERIOD_SEC, MIN_ROTATION_PERIOD_SEC,
};
