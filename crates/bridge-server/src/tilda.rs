//! Tilda form metadata client
//!
//! Pass-through access to the form platform's own form/field metadata. Not
//! consulted by the pipeline; only backs the inspection endpoints.

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Client for the Tilda public API
#[derive(Debug, Clone)]
pub struct TildaClient {
    base_url: String,
    public_key: Option<String>,
    secret_key: Option<String>,
    project_id: Option<i64>,
    client: Client,
}

impl TildaClient {
    /// Create a client from the server configuration
    pub fn new(config: &ServerConfig) -> ServerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServerError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.tilda_api_base_url.trim_end_matches('/').to_string(),
            public_key: config.tilda_public_key.clone(),
            secret_key: config.tilda_secret_key.clone(),
            project_id: config.tilda_project_id,
            client,
        })
    }

    /// Auth query parameters; missing keys are a configuration-level failure
    fn auth_params(&self) -> ServerResult<Vec<(String, String)>> {
        match (&self.public_key, &self.secret_key) {
            (Some(public), Some(secret)) => Ok(vec![
                ("publickey".to_string(), public.clone()),
                ("secretkey".to_string(), secret.clone()),
            ]),
            _ => Err(ServerError::FormPlatformError(
                "Tilda API keys are not configured".to_string(),
            )),
        }
    }

    async fn get(&self, path: &str, params: Vec<(String, String)>) -> ServerResult<Value> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .query(&params)
            .send()
            .await
            .map_err(|e| ServerError::FormPlatformError(e.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|e| ServerError::FormPlatformError(e.to_string()))?;
        let data: Value = response
            .json()
            .await
            .map_err(|e| ServerError::FormPlatformError(e.to_string()))?;
        Ok(data)
    }

    /// List the forms of a project
    pub async fn list_forms(&self, project_id: Option<i64>) -> ServerResult<Vec<Value>> {
        let mut params = self.auth_params()?;
        if let Some(project) = project_id.or(self.project_id) {
            params.push(("projectid".to_string(), project.to_string()));
        }

        let data = self.get("project/getformslist/", params).await?;
        let result = data.get("result").ok_or_else(|| {
            ServerError::FormPlatformError(format!("Unexpected response from Tilda: {}", data))
        })?;

        // Tilda wraps the list differently depending on the endpoint version.
        let forms = result.get("forms").unwrap_or(result);
        let Value::Array(forms) = forms else {
            return Err(ServerError::FormPlatformError(format!(
                "Tilda did not return a list of forms: {}",
                data
            )));
        };

        debug!(forms = forms.len(), "Listed Tilda forms");
        Ok(forms.clone())
    }

    /// Fetch one form's metadata
    pub async fn get_form(&self, form_id: i64) -> ServerResult<Value> {
        let mut params = self.auth_params()?;
        params.push(("formid".to_string(), form_id.to_string()));

        let data = self.get("form/getform/", params).await?;
        match data.get("result") {
            Some(result @ Value::Object(_)) => Ok(result.clone()),
            _ => Err(ServerError::FormPlatformError(format!(
                "Unexpected response from Tilda: {}",
                data
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> TildaClient {
        let config = ServerConfig {
            tilda_api_base_url: server.uri(),
            tilda_public_key: Some("pk".to_string()),
            tilda_secret_key: Some("sk".to_string()),
            tilda_project_id: Some(7),
            ..Default::default()
        };
        TildaClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn list_forms_unwraps_both_envelope_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/project/getformslist/"))
            .and(query_param("publickey", "pk"))
            .and(query_param("projectid", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "forms": [{ "formid": 1 }] },
            })))
            .mount(&server)
            .await;

        let forms = client_for(&server).list_forms(None).await.unwrap();
        assert_eq!(forms.len(), 1);
    }

    #[tokio::test]
    async fn missing_keys_fail_before_any_request() {
        let client = TildaClient::new(&ServerConfig::default()).unwrap();
        let err = client.list_forms(None).await.unwrap_err();
        assert!(matches!(err, ServerError::FormPlatformError(_)));
    }

    #[tokio::test]
    async fn get_form_requires_an_object_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/form/getform/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "nope" })))
            .mount(&server)
            .await;

        let err = client_for(&server).get_form(5).await.unwrap_err();
        assert!(matches!(err, ServerError::FormPlatformError(_)));
    }
}
