// QuectoFlow — HTTP adapter for api_call steps

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unsupported HTTP method '{}'", other)),
        }
    }
}

/// Status and decoded body of an API response.
///
/// `body` is `None` when the response was not valid JSON.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<Value>,
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Issue `method` against `endpoint`. `inputs` are sent as query
    /// parameters for GET and as a JSON body otherwise.
    async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        inputs: &Map<String, Value>,
    ) -> anyhow::Result<ApiResponse>;
}

/// reqwest-backed [`ApiClient`].
#[derive(Clone)]
pub struct ReqwestApiClient {
    client: Client,
}

impl ReqwestApiClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

/// Query-string form of an input value. Strings go out unquoted.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ApiClient for ReqwestApiClient {
    async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        inputs: &Map<String, Value>,
    ) -> anyhow::Result<ApiResponse> {
        let url = url::Url::parse(endpoint)?;

        let builder = match method {
            HttpMethod::Get => {
                let query: Vec<(String, String)> = inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), query_value(v)))
                    .collect();
                self.client.get(url).query(&query)
            }
            HttpMethod::Post => self.client.post(url).json(inputs),
            HttpMethod::Put => self.client.put(url).json(inputs),
            HttpMethod::Delete => self.client.delete(url).json(inputs),
        };

        tracing::debug!(method = %method, endpoint = %endpoint, "Sending API request");
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).ok();
        tracing::debug!(status = status, body_len = text.len(), "API response received");

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("DELETE".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
        assert!("PATCH".parse::<HttpMethod>().is_err());
        assert_eq!(HttpMethod::Put.to_string(), "PUT");
    }

    #[test]
    fn test_query_value_unquotes_strings() {
        assert_eq!(query_value(&json!("dentist")), "dentist");
        assert_eq!(query_value(&json!(10)), "10");
        assert_eq!(query_value(&json!(true)), "true");
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let client = ReqwestApiClient::new(Duration::from_secs(1)).unwrap();
        let result = client
            .request(HttpMethod::Get, "not a url", &Map::new())
            .await;
        assert!(result.is_err());
    }
}
