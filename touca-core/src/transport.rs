/// touca's transport is a thin wrapper around `reqwest::Client` bound to one
/// server and API key. It only knows the endpoints the SDK consumes; retries
/// are left to the caller.
use reqwest::{header::HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{options::SubmissionMode, Error, Result};

const HEADER_API_KEY: &str = "X-Touca-API-Key";
const HEADER_SUBMISSION_MODE: &str = "X-Touca-Submission-Mode";

/// Entry of the request sent to resolve workflow options remotely.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionsRequest {
    pub team: String,
    pub suite: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testcases: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OptionsResponse {
    pub version: String,
    #[serde(default)]
    pub testcases: Vec<String>,
}

/// Comparison summary the server may return for synchronous submissions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComparisonOverview {
    pub testcase: String,
    pub matched: bool,
}

#[derive(Debug, Deserialize)]
struct Element {
    name: String,
}

#[derive(Clone)]
pub struct Transport {
    inner: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(api_url: &str, api_key: &str) -> Result<Transport> {
        HeaderValue::from_str(api_key)
            .map_err(|_| Error::Auth("API key contains invalid characters".into()))?;
        let inner = reqwest::Client::builder()
            .user_agent(concat!("touca-rust/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Transport {
            inner,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let url = self.url(path);
        debug!("Requesting POST {url}");
        self.inner
            .post(url)
            .header(HEADER_API_KEY, &self.api_key)
    }

    /// Verify that the API key is accepted by the server.
    pub async fn authenticate(&self) -> Result<()> {
        let res = self
            .post("client/verify")
            .send()
            .await
            .map_err(|e| Error::Auth(format!("server {} is unreachable: {e}", self.api_url)))?;
        match res.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(Error::Auth("invalid API key".into())),
            status => Err(Error::Auth(format!(
                "unexpected response from server: {status}"
            ))),
        }
    }

    /// Test cases submitted to the latest version of a suite.
    pub async fn get_testcases(&self, team: &str, suite: &str) -> Result<Vec<String>> {
        let url = self.url(&format!("client/element/{team}/{suite}"));
        debug!("Requesting GET {url}");
        let res = self
            .inner
            .get(url)
            .header(HEADER_API_KEY, &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        match res.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let elements: Vec<Element> = res
                    .json()
                    .await
                    .map_err(|e| Error::Transport(format!("unexpected response: {e}")))?;
                Ok(elements.into_iter().map(|e| e.name).collect())
            }
            status => Err(Error::Transport(format!(
                "failed to fetch test cases: {status}"
            ))),
        }
    }

    /// Resolve version and test cases of workflows that did not specify them.
    pub async fn fetch_options(&self, requests: &[OptionsRequest]) -> Result<Vec<OptionsResponse>> {
        let res = self
            .post("client/options")
            .json(requests)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        match res.status() {
            status if status.is_success() => {
                let responses: Vec<OptionsResponse> = res
                    .json()
                    .await
                    .map_err(|e| Error::Transport(format!("unexpected response: {e}")))?;
                if responses.len() != requests.len() {
                    return Err(Error::Transport(format!(
                        "expected options for {} workflows, received {}",
                        requests.len(),
                        responses.len()
                    )));
                }
                Ok(responses)
            }
            StatusCode::UNAUTHORIZED => Err(Error::Auth("invalid API key".into())),
            StatusCode::CONFLICT => {
                let first = requests.first();
                Err(Error::RemoteOptionsSealed {
                    suite: first.map_or_else(|| "unknown".into(), |r| r.suite.clone()),
                    version: first
                        .and_then(|r| r.version.clone())
                        .unwrap_or_else(|| "unknown".into()),
                })
            }
            status => Err(Error::Transport(format!(
                "failed to fetch remote options: {status}"
            ))),
        }
    }

    /// Submit a binary container. Synchronous submissions may be answered with
    /// the comparison result of each submitted test case.
    pub async fn post_results(
        &self,
        content: Vec<u8>,
        mode: SubmissionMode,
    ) -> Result<Vec<ComparisonOverview>> {
        let res = self
            .post("client/submit")
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(HEADER_SUBMISSION_MODE, mode.as_ref())
            .body(content)
            .send()
            .await
            .map_err(|e| Error::PostFailed(e.to_string()))?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            let detail = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("errors").cloned())
                .map_or(body, |errors| errors.to_string());
            return Err(Error::PostFailed(format!("{status}: {detail}")));
        }
        if mode == SubmissionMode::Async || body.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            debug!("ignoring submission response that is not a comparison overview: {e}");
            Vec::new()
        }))
    }

    /// Tell the server no more results will be submitted for this version.
    pub async fn seal(&self, team: &str, suite: &str, version: &str) -> Result<()> {
        let res = self
            .post(&format!("batch/{team}/{suite}/{version}/seal2"))
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        match res.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(Error::Auth("invalid API key".into())),
            status => Err(Error::Transport(format!("failed to seal version: {status}"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn post_results_reports_comparison() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let submit = server
            .mock("POST", "/client/submit")
            .match_header(HEADER_API_KEY, "key")
            .match_header(HEADER_SUBMISSION_MODE, "sync")
            .with_status(200)
            .with_body(r#"[{"testcase": "alice", "matched": false}]"#)
            .create_async()
            .await;

        let transport = Transport::new(&server.url(), "key")?;
        let overview = transport
            .post_results(vec![1, 2, 3], SubmissionMode::Sync)
            .await?;
        submit.assert_async().await;
        assert_eq!(
            overview,
            vec![ComparisonOverview {
                testcase: "alice".into(),
                matched: false
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn post_results_carries_server_errors() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/client/submit")
            .with_status(400)
            .with_body(r#"{"errors": ["batch is sealed"]}"#)
            .create_async()
            .await;

        let transport = Transport::new(&server.url(), "key")?;
        let err = transport
            .post_results(vec![], SubmissionMode::Async)
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::PostFailed(detail) if detail.contains("batch is sealed")), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn missing_suite_has_no_testcases() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/client/element/acme/students")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/client/element/acme/teachers")
            .with_status(200)
            .with_body(r#"[{"name": "alice"}, {"name": "bob"}]"#)
            .create_async()
            .await;

        let transport = Transport::new(&server.url(), "key")?;
        assert!(transport.get_testcases("acme", "students").await?.is_empty());
        assert_eq!(
            transport.get_testcases("acme", "teachers").await?,
            vec!["alice".to_string(), "bob".to_string()]
        );
        Ok(())
    }
}
