//! HTTP clients for the discovery and import collaborators.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::endpoints::DiscoveredEndpointSet;
use crate::traits::{BaseImporter, BaseSiteDiscovery, ImportOutcome, ImportRequest};

/// Discovery request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverRequest<'a> {
    site_url: &'a str,
}

fn service_url(base: &Url, path: &str) -> Result<Url> {
    // keep any path prefix on the base URL
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(path)
        .with_context(|| format!("Invalid service URL {}{}", base, path))
}

async fn check_status(response: reqwest::Response, service: &str) -> Result<reqwest::Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} error {}: {}", service, status, body);
    }
    Ok(response)
}

/// [`BaseSiteDiscovery`] backed by the discovery service
/// (`POST {base}/discover`).
pub struct HttpSiteDiscovery {
    discover_url: Url,
    client: reqwest::Client,
}

impl HttpSiteDiscovery {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).context("DISCOVERY_SERVICE_URL is not a valid URL")?;
        Ok(Self {
            discover_url: service_url(&base, "discover")?,
            client: reqwest::Client::builder()
                .build()
                .context("Failed to create HTTP client")?,
        })
    }
}

#[async_trait]
impl BaseSiteDiscovery for HttpSiteDiscovery {
    /// The site itself must answer before discovery is worth asking for.
    async fn probe(&self, site_url: &str) -> Result<()> {
        let response = self
            .client
            .get(site_url)
            .send()
            .await
            .with_context(|| format!("{} did not respond", site_url))?;
        check_status(response, site_url).await?;
        Ok(())
    }

    async fn discover(&self, site_url: &str) -> Result<DiscoveredEndpointSet> {
        let response = self
            .client
            .post(self.discover_url.clone())
            .json(&DiscoverRequest { site_url })
            .send()
            .await
            .context("Failed to send discovery request")?;

        check_status(response, "Discovery service")
            .await?
            .json()
            .await
            .context("Failed to parse discovery response")
    }
}

/// [`BaseImporter`] backed by the import service (`POST {base}/import`).
pub struct HttpImporter {
    import_url: Url,
    client: reqwest::Client,
}

impl HttpImporter {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).context("IMPORT_SERVICE_URL is not a valid URL")?;
        Ok(Self {
            import_url: service_url(&base, "import")?,
            client: reqwest::Client::builder()
                .build()
                .context("Failed to create HTTP client")?,
        })
    }
}

#[async_trait]
impl BaseImporter for HttpImporter {
    async fn import_role(&self, request: ImportRequest) -> Result<ImportOutcome> {
        let response = self
            .client
            .post(self.import_url.clone())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} import request", request.role))?;

        check_status(response, "Import service")
            .await?
            .json()
            .await
            .context("Failed to parse import response")
    }
}
