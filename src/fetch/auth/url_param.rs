use crate::fetch::client::HttpClient;
use async_trait::async_trait;

/// An [`HttpClient`] wrapper that appends an API key as a URL query parameter.
///
/// The 511 API takes its key as `api_key=<key>`. The key is added at send time
/// so the URLs built and logged by the fetcher never contain it.
pub struct UrlParam<C> {
    pub inner: C,
    pub param_name: String,
    pub key: String,
}

impl<C> UrlParam<C> {
    pub fn new(inner: C, param_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            inner,
            param_name: param_name.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for UrlParam<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.url_mut()
            .query_pairs_mut()
            .append_pair(&self.param_name, &self.key);
        self.inner.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, ScriptedClient};

    #[tokio::test]
    async fn test_key_appended_at_send_time() {
        let scripted = ScriptedClient::new(vec![Reply::ok("{}")]);
        let client = UrlParam::new(scripted.clone(), "api_key", "secret");
        let req = reqwest::Request::new(
            reqwest::Method::GET,
            "https://api.511.org/transit/StopMonitoring?agency=SF".parse().unwrap(),
        );

        client.execute(req).await.unwrap();

        let urls = scripted.requested_urls();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].ends_with("agency=SF&api_key=secret"), "{}", urls[0]);
    }
}
