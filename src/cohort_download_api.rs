//! An HTTP client that downloads cohort members from the cohort server.
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{blocking::Client as HttpClient, StatusCode, Url};

use crate::{
    cohort::{Cohort, CohortDescription},
    Error, Result,
};

pub(crate) const LIBRARY_HEADER: &str = "X-Amp-Exp-Library";

pub(crate) fn library_name() -> String {
    format!("experiment-rust-server/{}", env!("CARGO_PKG_VERSION"))
}

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

pub trait CohortDownloadApi: Send + Sync {
    /// Download cohort `cohort_id`.
    ///
    /// When `existing` is given only a newer version is downloaded: `Ok(None)` means the stored
    /// version is current.
    fn get_cohort(&self, cohort_id: &str, existing: Option<&Cohort>) -> Result<Option<Cohort>>;
}

/// Downloads cohorts straight from the cohort server.
pub struct DirectCohortDownloadApi {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: HttpClient,
    server_url: String,
    authorization: String,
    max_cohort_size: u32,
}

impl DirectCohortDownloadApi {
    pub fn new(
        api_key: &str,
        secret_key: &str,
        max_cohort_size: u32,
        server_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<DirectCohortDownloadApi> {
        let client = HttpClient::builder().timeout(request_timeout).build()?;
        Ok(DirectCohortDownloadApi {
            client,
            server_url: server_url.into(),
            authorization: basic_auth(api_key, secret_key),
            max_cohort_size,
        })
    }

    fn cohort_url(&self, cohort_id: &str, existing: Option<&Cohort>) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidServerUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["sdk", "v1", "cohort", cohort_id]);
        url.query_pairs_mut()
            .append_pair("maxCohortSize", &self.max_cohort_size.to_string());
        if let Some(existing) = existing {
            url.query_pairs_mut()
                .append_pair("lastModified", &existing.last_modified.to_string());
        }
        Ok(url)
    }

    fn request(&self, url: &Url) -> Result<Option<Cohort>> {
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .header(LIBRARY_HEADER, library_name())
            .send()?;

        match response.status() {
            StatusCode::OK => {
                let description: CohortDescription = response.json()?;
                Ok(Some(Cohort::from(description)))
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::PAYLOAD_TOO_LARGE => Err(Error::CohortTooLarge),
            StatusCode::UNAUTHORIZED => Err(Error::Unauthorized),
            status => Err(Error::HttpStatus(status.as_u16())),
        }
    }
}

impl CohortDownloadApi for DirectCohortDownloadApi {
    fn get_cohort(&self, cohort_id: &str, existing: Option<&Cohort>) -> Result<Option<Cohort>> {
        log::debug!(target: "experiment", cohort_id; "downloading cohort");
        let url = self.cohort_url(cohort_id, existing)?;
        let result = with_retries(MAX_ATTEMPTS, RETRY_DELAY, || self.request(&url));
        match &result {
            Ok(Some(cohort)) => {
                log::debug!(target: "experiment", cohort_id, size = cohort.size; "downloaded cohort")
            }
            Ok(None) => log::debug!(target: "experiment", cohort_id; "cohort not modified"),
            Err(Error::CohortTooLarge) => {
                log::warn!(target: "experiment", cohort_id, max_cohort_size = self.max_cohort_size; "cohort exceeds max cohort size")
            }
            Err(err) => log::warn!(target: "experiment", cohort_id; "cohort download failed: {err}"),
        }
        result
    }
}

fn basic_auth(api_key: &str, secret_key: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{api_key}:{secret_key}")))
}

/// Run `request` up to `attempts` times, sleeping `delay` between attempts. Only transient
/// errors are retried.
fn with_retries<T>(attempts: u32, delay: Duration, mut request: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match request() {
            Err(err) if err.is_transient() && attempt < attempts => {
                log::debug!(target: "experiment", attempt; "retrying request after error: {err}");
                attempt += 1;
                std::thread::sleep(delay);
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, time::Duration};

    use super::*;
    use crate::{cohort::tests::cohort, test_server::serve};

    fn api() -> DirectCohortDownloadApi {
        DirectCohortDownloadApi::new(
            "api",
            "secret",
            10,
            "https://cohort.example.com/",
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn basic_auth_header() {
        assert_eq!(basic_auth("api", "secret"), "Basic YXBpOnNlY3JldA==");
    }

    #[test]
    fn cohort_urls() {
        let api = api();
        assert_eq!(
            api.cohort_url("abc", None).unwrap().as_str(),
            "https://cohort.example.com/sdk/v1/cohort/abc?maxCohortSize=10"
        );
        let existing = cohort("abc", 1234, "user", &[]);
        assert_eq!(
            api.cohort_url("abc", Some(&existing)).unwrap().as_str(),
            "https://cohort.example.com/sdk/v1/cohort/abc?maxCohortSize=10&lastModified=1234"
        );
        assert_eq!(
            api.cohort_url("a/b c", None).unwrap().as_str(),
            "https://cohort.example.com/sdk/v1/cohort/a%2Fb%20c?maxCohortSize=10"
        );
    }

    #[test]
    fn cohort_url_keeps_server_path_prefix() {
        let api = DirectCohortDownloadApi::new("api", "secret", 10, "https://example.com/proxy", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            api.cohort_url("abc", None).unwrap().as_str(),
            "https://example.com/proxy/sdk/v1/cohort/abc?maxCohortSize=10"
        );
    }

    fn local_api(url: &str) -> DirectCohortDownloadApi {
        DirectCohortDownloadApi::new("api", "secret", 10, url, Duration::from_secs(5)).unwrap()
    }

    const COHORT_BODY: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 84\r\nconnection: close\r\n\r\n\
        {\"cohortId\":\"c1\",\"lastModified\":5,\"size\":2,\"memberIds\":[\"a\",\"b\"],\"groupType\":\"user\"}";

    #[test]
    fn downloads_cohort() {
        let (url, requests) = serve(vec![COHORT_BODY], Duration::ZERO);

        let downloaded = local_api(&url).get_cohort("c1", None).unwrap();

        assert_eq!(downloaded, Some(cohort("c1", 5, "user", &["a", "b"])));
        assert_eq!(
            requests.recv_timeout(Duration::from_secs(5)).unwrap(),
            "GET /sdk/v1/cohort/c1?maxCohortSize=10 HTTP/1.1"
        );
    }

    #[test]
    fn not_modified_cohort() {
        let (url, requests) = serve(
            vec!["HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n"],
            Duration::ZERO,
        );
        let existing = cohort("c1", 5, "user", &["a"]);

        let downloaded = local_api(&url).get_cohort("c1", Some(&existing)).unwrap();

        assert_eq!(downloaded, None);
        assert_eq!(
            requests.recv_timeout(Duration::from_secs(5)).unwrap(),
            "GET /sdk/v1/cohort/c1?maxCohortSize=10&lastModified=5 HTTP/1.1"
        );
    }

    #[test]
    fn too_large_cohort_is_not_retried() {
        let (url, requests) = serve(
            vec![
                "HTTP/1.1 413 Payload Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                COHORT_BODY,
            ],
            Duration::ZERO,
        );

        let result = local_api(&url).get_cohort("c1", None);

        assert!(matches!(result, Err(Error::CohortTooLarge)));
        assert!(requests.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(requests.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn error_statuses() {
        let (url, _requests) = serve(
            vec!["HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"],
            Duration::ZERO,
        );
        assert!(matches!(local_api(&url).get_cohort("c1", None), Err(Error::Unauthorized)));

        let (url, _requests) = serve(
            vec!["HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"],
            Duration::ZERO,
        );
        assert!(matches!(local_api(&url).get_cohort("c1", None), Err(Error::HttpStatus(404))));
    }

    #[test]
    fn server_errors_are_retried() {
        let (url, requests) = serve(
            vec![
                "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                COHORT_BODY,
            ],
            Duration::ZERO,
        );

        let downloaded = local_api(&url).get_cohort("c1", None).unwrap();

        assert_eq!(downloaded, Some(cohort("c1", 5, "user", &["a", "b"])));
        assert_eq!(requests.iter().take(2).count(), 2);
    }

    #[test]
    fn transient_errors_are_retried() {
        let calls = Cell::new(0);
        let result = with_retries(3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::HttpStatus(503))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retries(3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(Error::HttpStatus(429))
        });
        assert!(matches!(result, Err(Error::HttpStatus(429))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        for err in [Error::CohortTooLarge, Error::HttpStatus(404), Error::Unauthorized] {
            let calls = Cell::new(0);
            let result: Result<()> = with_retries(3, Duration::ZERO, || {
                calls.set(calls.get() + 1);
                Err(err.clone())
            });
            assert!(result.is_err());
            assert_eq!(calls.get(), 1);
        }
    }
}
