//! Remote KZ global API client: routes, transport, and the retrying fetcher.

pub mod fetcher;
pub mod models;
pub mod proxy_pool;
pub mod sleeper;
pub mod transport;

pub use fetcher::{FetchOutcome, RateLimitedFetcher, RetryPolicy};
pub use models::ExternalRecord;
pub use proxy_pool::{ProxyPool, Route};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
pub use transport::{FetchRequest, FetchTarget, HttpTransport, Transport, TransportResponse};
