// Web module
// Live search with a persistent result cache, and concurrent page crawling

pub mod crawler;
pub mod search;

pub use crawler::{CrawlerConfig, PageContent, WebCrawler, save_crawled_data, validate_url};
pub use search::{SearchCache, SearchProvider, SearchResult, SerpApiProvider, WebSearcher};
