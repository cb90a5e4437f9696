//! Fetching the full set of flag configs from the flag server.
use std::{sync::Arc, time::Duration};

use reqwest::{blocking::Client as HttpClient, StatusCode, Url};

use crate::{
    cohort_download_api::{library_name, LIBRARY_HEADER},
    evaluation::{models::TryParse, Flag},
    flag_config_storage::FlagConfigs,
    Error, Result,
};

pub trait FlagConfigApi: Send + Sync {
    /// Fetch every flag config for the deployment.
    fn get_flag_configs(&self) -> Result<FlagConfigs>;
}

/// Polls `/sdk/v2/flags` on the flag server.
pub struct FlagConfigApiV2 {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: HttpClient,
    url: Url,
    authorization: String,
}

impl FlagConfigApiV2 {
    pub fn new(
        deployment_key: &str,
        server_url: &str,
        request_timeout: Duration,
    ) -> Result<FlagConfigApiV2> {
        let client = HttpClient::builder().timeout(request_timeout).build()?;
        Ok(FlagConfigApiV2 {
            client,
            url: flags_url(server_url)?,
            authorization: format!("Api-Key {deployment_key}"),
        })
    }
}

impl FlagConfigApi for FlagConfigApiV2 {
    fn get_flag_configs(&self) -> Result<FlagConfigs> {
        log::debug!(target: "experiment", "fetching flag configs");
        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .header(LIBRARY_HEADER, library_name())
            .send()?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "experiment", "client is not authorized to fetch flag configs. Check your deployment key");
                return Err(Error::Unauthorized);
            }
            status => {
                log::warn!(target: "experiment", status = status.as_u16(); "received non-200 response while fetching flag configs");
                return Err(Error::HttpStatus(status.as_u16()));
            }
        }

        let body = response.text()?;
        let flag_configs = parse_flag_configs(&body)?;
        log::debug!(target: "experiment", count = flag_configs.len(); "fetched flag configs");
        Ok(flag_configs)
    }
}

fn flags_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url)?.join("sdk/v2/flags")?;
    url.set_query(Some("v=0"));
    Ok(url)
}

/// Parse a JSON array of flags. A flag that fails to parse is skipped with a warning instead of
/// failing the whole list.
pub(crate) fn parse_flag_configs(body: &str) -> Result<FlagConfigs> {
    let flags: Vec<TryParse<Flag>> = serde_json::from_str(body)?;
    let mut flag_configs = FlagConfigs::with_capacity(flags.len());
    for flag in flags {
        match flag {
            TryParse::Parsed(flag) => {
                flag_configs.insert(flag.key.clone(), Arc::new(flag));
            }
            TryParse::ParseFailed(value) => {
                let key = value.get("key").and_then(|key| key.as_str()).unwrap_or("");
                log::warn!(target: "experiment", flag_key = key; "failed to parse flag config, skipping");
            }
        }
    }
    Ok(flag_configs)
}
