//! PTP (IEEE 1588) clock abstraction used to correlate RTP timestamps
//! with wall-clock/hardware time for archival and rotation.

mod clock;
mod phc;

pub use clock::{PtpClock, PtpConfig, PtpMode};
