//! Block feed abstraction, the reorg window and the head tracker that turns a
//! raw header stream into an ordered, gap-free sequence of canonical heads.

mod backoff;
pub mod feed;
pub mod tracker;
pub mod window;

pub use feed::BlockFeed;
pub use tracker::{HeadTracker, HeadTrackerConfig, HeadTrackerError};
pub use window::HeadWindow;
