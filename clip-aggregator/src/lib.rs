pub mod types;
pub mod clock;
pub mod traits;
pub mod helix;
pub mod token;
pub mod identity;
pub mod fetcher;
pub mod channel_stream;
pub mod aggregator;
pub mod decoder;
pub mod sources;
pub mod reconciler;
pub mod server;

pub use types::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use traits::{ByteStream, ClipFeed, HelixApi};
pub use helix::HelixClient;
pub use token::TokenProvider;
pub use identity::IdentityResolver;
pub use fetcher::PageFetcher;
pub use channel_stream::{ChannelStream, EarlyExitPolicy};
pub use aggregator::ClipAggregator;
pub use decoder::{decode_batches, ClipLineCodec};
pub use sources::{HttpClipFeed, LocalClipFeed};
pub use reconciler::{ClipSet, ClipView, QueryPhase, Reconciler};
