use std::{sync::OnceLock, time::Duration};

use reqwest::header::CONTENT_TYPE;

use crate::api::Problem;

pub(crate) type ReqResult<T> = std::result::Result<T, Problem>;

const TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP client for CA and revocation responder traffic.
pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(TIMEOUT)
            .timeout(TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default()
    })
}

pub(crate) async fn req_get(url: &str) -> reqwest::Result<reqwest::Response> {
    log::trace!("GET {url}");
    http_client().get(url).send().await
}

pub(crate) async fn req_head(url: &str) -> reqwest::Result<reqwest::Response> {
    log::trace!("HEAD {url}");
    http_client().head(url).send().await
}

pub(crate) async fn req_post(url: &str, body: String) -> reqwest::Result<reqwest::Response> {
    log::trace!("POST {url} {body}");
    http_client()
        .post(url)
        .header(CONTENT_TYPE, "application/jose+json")
        .body(body)
        .send()
        .await
}

/// Turns non-2xx responses into a [`Problem`], decoding `application/problem+json` bodies.
pub(crate) async fn req_handle_error(res: reqwest::Response) -> ReqResult<reqwest::Response> {
    // ok responses pass through
    if res.status().is_success() {
        return Ok(res);
    }

    let status = res.status();
    let is_problem = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    let body = req_safe_read_body(res).await;

    let problem = if is_problem {
        serde_json::from_str(&body).unwrap_or_else(|err| Problem {
            _type: "problemJsonFail".to_owned(),
            detail: Some(format!(
                "Failed to deserialize application/problem+json ({err}) body: {body}"
            )),
            subproblems: None,
        })
    } else {
        Problem::http(status, &body)
    };

    Err(problem)
}

pub(crate) fn req_expect_header(res: &reqwest::Response, name: &str) -> ReqResult<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Problem {
            _type: format!("Missing header: {name}"),
            detail: None,
            subproblems: None,
        })
}

pub(crate) async fn req_safe_read_body(res: reqwest::Response) -> String {
    // letsencrypt sometimes closes the TLS abruptly causing io error
    // even though we did capture the body.
    res.text().await.unwrap_or_default()
}
