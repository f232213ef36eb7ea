//! 目录/协作 API 访问：传输网关、分页与并发拉取

pub mod fanout;
pub mod paging;
pub mod transport;

pub use fanout::{BackoffStrategy, CollectionFetcher, FetchOrchestrator, PagedCollectionFetcher, RetryPolicy};
pub use paging::collect_pages;
pub use transport::{ApiReply, GraphTransport};
