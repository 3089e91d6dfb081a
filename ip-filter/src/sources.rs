use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, ensure};
use ipnet::Ipv4Net;
use tracing::debug;

use crate::model::parse_zone;

pub const DEFAULT_ZONE_URL: &str =
    "https://www.ipdeny.com/ipblocks/data/aggregated/{cc}-aggregated.zone";
const COUNTRY_PLACEHOLDER: &str = "{cc}";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where per-country CIDR lists come from.
pub enum ZoneSource {
    Http {
        client: reqwest::Client,
        template: String,
    },
    /// Directory holding `{cc}-aggregated.zone` files.
    Dir(PathBuf),
}

impl ZoneSource {
    pub fn http(template: &str) -> Result<Self> {
        ensure!(
            template.contains(COUNTRY_PLACEHOLDER),
            "zone url template must contain {COUNTRY_PLACEHOLDER}"
        );
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(ZoneSource::Http {
            client,
            template: template.to_string(),
        })
    }

    pub fn dir(path: PathBuf) -> Self {
        ZoneSource::Dir(path)
    }

    pub fn location(&self, country: &str) -> String {
        match self {
            ZoneSource::Http { template, .. } => template.replace(COUNTRY_PLACEHOLDER, country),
            ZoneSource::Dir(dir) => dir
                .join(format!("{country}-aggregated.zone"))
                .display()
                .to_string(),
        }
    }

    pub async fn fetch(&self, country: &str) -> Result<Vec<Ipv4Net>> {
        let location = self.location(country);
        debug!(country, %location, "fetching zone list");
        let body = match self {
            ZoneSource::Http { client, .. } => client
                .get(&location)
                .send()
                .await
                .and_then(|resp| resp.error_for_status())
                .with_context(|| format!("failed to request {location}"))?
                .text()
                .await
                .with_context(|| format!("failed to read body of {location}"))?,
            ZoneSource::Dir(_) => tokio::fs::read_to_string(&location)
                .await
                .with_context(|| format!("failed to read {location}"))?,
        };
        parse_zone(body.as_bytes(), &location)
    }
}
