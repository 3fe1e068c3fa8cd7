pub mod search_api;
pub mod static_feed;

pub use search_api::{SearchApiConfig, SearchApiSource};
pub use static_feed::StaticSource;
