pub mod http;
pub mod local;

pub use http::HttpClipFeed;
pub use local::LocalClipFeed;
