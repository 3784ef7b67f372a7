use reqwest::Client;

use crate::constants::HTTP_TIMEOUT;

/// Creates the HTTP client used for playlist downloads and API calls.
/// Every request carries the configured player User-Agent.
pub fn create_http_client(user_agent: &str) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(HTTP_TIMEOUT)
        .build()
}

/// GET a URL and return its body as text, failing on non-2xx status
pub async fn fetch_text(client: &Client, url: &str) -> reqwest::Result<String> {
    client.get(url).send().await?.error_for_status()?.text().await
}
