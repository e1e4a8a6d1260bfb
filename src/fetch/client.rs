use async_trait::async_trait;
use reqwest::{Request, Response};

/// Seam between the fetcher and the network. Tests swap in scripted clients.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
