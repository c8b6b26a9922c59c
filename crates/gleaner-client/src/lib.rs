#[cfg(feature = "browser")]
pub mod browser_fetcher;
pub mod fetcher;
pub mod query;
pub mod strategy;

#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserFetcher;
pub use fetcher::HttpFetcher;
pub use query::{HtmlDocument, HtmlQuery};
pub use strategy::{ClientFetcher, ClientFetcherFactory};
