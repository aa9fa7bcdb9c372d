//! Shared GET transport with a bounded redirect chain.
//!
//! Clients are built with automatic redirects disabled so the hop cap is
//! enforced here and surfaces as [`UpdaterError::RedirectLoop`].

use crate::error::{Result, UpdaterError};
use reqwest::header::{ACCEPT, LOCATION, USER_AGENT};
use reqwest::{redirect, Client, Response, Url};
use std::time::Duration;
use tracing::debug;

/// Maximum number of redirects followed for a single request.
pub const MAX_REDIRECTS: usize = 5;

/// Build a client that leaves redirects to [`get`].
pub fn client() -> Result<Client> {
    Client::builder()
        .redirect(redirect::Policy::none())
        .build()
        .map_err(UpdaterError::from)
}

/// Per-request settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GetRequest<'a> {
    pub user_agent: &'a str,
    pub accept: Option<&'a str>,
    pub timeout: Duration,
}

/// Issue a GET, following `Location` up to [`MAX_REDIRECTS`] times.
///
/// The final response is returned whatever its status; callers decide what
/// counts as success.
pub(crate) async fn get(client: &Client, url: &str, request: GetRequest<'_>) -> Result<Response> {
    let mut current = Url::parse(url)
        .map_err(|err| UpdaterError::validation(format!("invalid URL {url}: {err}")))?;
    let mut hops = 0usize;

    loop {
        let mut builder = client
            .get(current.clone())
            .header(USER_AGENT, request.user_agent)
            .timeout(request.timeout);
        if let Some(accept) = request.accept {
            builder = builder.header(ACCEPT, accept);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| transport_error(err, &current))?;

        let redirect_to = if response.status().is_redirection() {
            response
                .headers()
                .get(LOCATION)
                .map(|value| value.to_str().map(str::to_owned))
        } else {
            None
        };
        let location = match redirect_to {
            Some(location) => location
                .map_err(|_| UpdaterError::Network(format!("malformed redirect from {current}")))?,
            None => return Ok(response),
        };

        if hops >= MAX_REDIRECTS {
            return Err(UpdaterError::RedirectLoop {
                url: url.to_string(),
                limit: MAX_REDIRECTS,
            });
        }

        let next = current.join(&location).map_err(|err| {
            UpdaterError::Network(format!("invalid redirect target {location:?}: {err}"))
        })?;
        hops += 1;
        debug!(hop = hops, from = %current, to = %next, "following redirect");
        current = next;
    }
}

/// Map a reqwest failure on `url`, keeping timeouts distinct.
pub(crate) fn transport_error(err: reqwest::Error, url: &Url) -> UpdaterError {
    if err.is_timeout() {
        UpdaterError::Timeout(url.to_string())
    } else {
        UpdaterError::Network(format!("{url}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GetRequest<'static> {
        GetRequest {
            user_agent: "test-agent",
            accept: None,
            timeout: Duration::from_secs(5),
        }
    }

    async fn mount_redirect_chain(server: &MockServer, hops: usize) {
        for hop in 0..hops {
            Mock::given(method("GET"))
                .and(path(format!("/hop{hop}")))
                .respond_with(
                    ResponseTemplate::new(302).insert_header("Location", format!("/hop{}", hop + 1)),
                )
                .mount(server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path(format!("/hop{hops}")))
            .respond_with(ResponseTemplate::new(200).set_body_string("done"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn follows_up_to_five_redirects() {
        let server = MockServer::start().await;
        mount_redirect_chain(&server, MAX_REDIRECTS).await;

        let response = get(&client().unwrap(), &format!("{}/hop0", server.uri()), request())
            .await
            .expect("five hops are allowed");
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn sixth_redirect_is_a_loop() {
        let server = MockServer::start().await;
        mount_redirect_chain(&server, MAX_REDIRECTS + 1).await;

        let err = get(&client().unwrap(), &format!("{}/hop0", server.uri()), request())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::RedirectLoop { limit: 5, .. }), "{err}");
    }

    #[tokio::test]
    async fn sends_user_agent_and_accept() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meta"))
            .and(header("user-agent", "test-agent"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let response = get(
            &client().unwrap(),
            &format!("{}/meta", server.uri()),
            GetRequest {
                accept: Some("application/json"),
                ..request()
            },
        )
        .await
        .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
            .mount(&server)
            .await;

        let err = get(
            &client().unwrap(),
            &server.uri(),
            GetRequest {
                timeout: Duration::from_millis(100),
                ..request()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpdaterError::Timeout(_)), "{err}");
    }
}
