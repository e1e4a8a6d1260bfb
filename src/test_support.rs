//! Scripted HTTP client shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::fetch::HttpClient;

#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
    },
    /// Never answers; exercises timeouts and cancellation.
    Hang,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Reply::Respond {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Reply::Respond {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Reply::Respond { headers, .. } = &mut self {
            headers.push((name, value.to_string()));
        }
        self
    }
}

/// Answers requests from a script, then repeats `fallback` (HTTP 503 unless set).
#[derive(Clone)]
pub struct ScriptedClient {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    fallback: Reply,
    urls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            fallback: Reply::status(503),
            urls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_fallback(mut self, fallback: Reply) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn calls(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.urls.lock().unwrap().push(req.url().to_string());
        let next = self.replies.lock().unwrap().pop_front();
        match next.unwrap_or_else(|| self.fallback.clone()) {
            Reply::Respond {
                status,
                headers,
                body,
            } => {
                let mut builder = http::Response::builder().status(status);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                Ok(reqwest::Response::from(builder.body(body).unwrap()))
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// A StopMonitoring payload with one visit per `(line, destination, expected)`.
pub fn payload(visits: &[(&str, &str, &str)]) -> String {
    let visits: Vec<serde_json::Value> = visits
        .iter()
        .map(|(line, dest, at)| {
            serde_json::json!({
                "MonitoredVehicleJourney": {
                    "LineRef": line,
                    "DestinationName": dest,
                    "MonitoredCall": { "ExpectedArrivalTime": at }
                }
            })
        })
        .collect();
    serde_json::json!({
        "ServiceDelivery": {
            "StopMonitoringDelivery": { "MonitoredStopVisit": visits }
        }
    })
    .to_string()
}
