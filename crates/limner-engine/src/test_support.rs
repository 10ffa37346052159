//! Blocking-friendly wrapper around a wiremock server.
//!
//! The clients under test use `reqwest::blocking`, which must not run inside
//! an async context, so the mock server is driven from its own runtime.

use tokio::runtime::Runtime;
use wiremock::{Mock, MockServer, Request};

pub struct MockHttp {
    // Dropped before the runtime that started it.
    server: MockServer,
    runtime: Runtime,
}

impl MockHttp {
    pub fn start() -> std::io::Result<Self> {
        let runtime = Runtime::new()?;
        let server = runtime.block_on(MockServer::start());
        Ok(Self { server, runtime })
    }

    pub fn mount(&self, mock: Mock) {
        self.runtime.block_on(mock.mount(&self.server));
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    pub fn received(&self) -> Vec<Request> {
        self.runtime
            .block_on(self.server.received_requests())
            .unwrap_or_default()
    }
}
