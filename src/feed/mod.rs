pub mod normalize;
pub mod upstream;

pub use normalize::parse_frame;
pub use upstream::{Delivery, FeedPipeline, UpstreamConfig, UpstreamFeed};
