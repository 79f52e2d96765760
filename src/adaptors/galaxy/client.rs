use std::fmt;
use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;

use super::error::GalaxyError;
use super::types::{
    CreateHistory, Dataset, History, JobDetails, ServerConfig, ServerVersion, ToolRunRequest,
    ToolRunResponse,
};

const UPLOAD_TOOL: &str = "upload1";

pub struct GalaxyClient {
    api_key: String,
    client: Client,
    base_url: Url,
}

impl fmt::Debug for GalaxyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GalaxyClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl GalaxyClient {
    /// `host` may carry a scheme and a port; `port` applies when it does not.
    pub fn new(host: &str, port: u16, api_key: String) -> Result<Self, GalaxyError> {
        let mut base_url =
            Url::parse(host).map_err(|e| GalaxyError::InvalidUrl(format!("{host}: {e}")))?;
        if base_url.port().is_none() {
            base_url
                .set_port(Some(port))
                .map_err(|_| GalaxyError::InvalidUrl(host.to_string()))?;
        }
        Self::with_base_url(base_url, api_key)
    }

    pub fn with_base_url(mut base_url: Url, api_key: String) -> Result<Self, GalaxyError> {
        // relative joins would drop a last path segment without the slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, GalaxyError> {
        self.base_url
            .join(path)
            .map_err(|e| GalaxyError::InvalidUrl(format!("{path}: {e}")))
    }

    fn get(&self, path: &str) -> Result<RequestBuilder, GalaxyError> {
        Ok(self.client.get(self.url(path)?).header("x-api-key", &self.api_key))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder, GalaxyError> {
        Ok(self.client.post(self.url(path)?).header("x-api-key", &self.api_key))
    }

    fn delete(&self, path: &str) -> Result<RequestBuilder, GalaxyError> {
        Ok(self
            .client
            .delete(self.url(path)?)
            .header("x-api-key", &self.api_key))
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, GalaxyError> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GalaxyError::from_body(status.as_u16(), &body));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, GalaxyError> {
        let response = self.send(req).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn version(&self) -> Result<ServerVersion, GalaxyError> {
        self.send_json(self.get("api/version")?).await
    }

    pub async fn configuration(&self) -> Result<ServerConfig, GalaxyError> {
        self.send_json(self.get("api/configuration")?).await
    }

    /// Non-deleted histories named `name`.
    pub async fn histories_named(&self, name: &str) -> Result<Vec<History>, GalaxyError> {
        let req = self.get("api/histories")?.query(&[("q", "name"), ("qv", name)]);
        let histories: Vec<History> = self.send_json(req).await?;
        Ok(histories
            .into_iter()
            .filter(|h| h.name == name && !h.deleted)
            .collect())
    }

    pub async fn delete_history(&self, id: &str, purge: bool) -> Result<(), GalaxyError> {
        let mut req = self.delete(&format!("api/histories/{id}"))?;
        if purge {
            req = req.query(&[("purge", "true")]);
        }
        self.send(req).await?;
        Ok(())
    }

    pub async fn create_history(&self, name: &str) -> Result<History, GalaxyError> {
        let req = self.post("api/histories")?.json(&CreateHistory { name });
        self.send_json(req).await
    }

    /// Uploads `path` into a history through the upload tool and returns the new dataset.
    pub async fn upload_file(
        &self,
        history_id: &str,
        path: &Path,
        name: &str,
    ) -> Result<Dataset, GalaxyError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| GalaxyError::Unexpected(format!("cannot read {}: {e}", path.display())))?;
        let inputs = serde_json::json!({
            "files_0|NAME": name,
            "files_0|type": "upload_dataset",
            "dbkey": "?",
            "file_type": "auto",
        });
        let form = Form::new()
            .text("tool_id", UPLOAD_TOOL)
            .text("history_id", history_id.to_string())
            .text("inputs", inputs.to_string())
            .part("files_0|file_data", Part::bytes(bytes).file_name(name.to_string()));

        let resp: ToolRunResponse = self
            .send_json(self.post("api/tools")?.multipart(form))
            .await?;
        resp.outputs
            .into_iter()
            .next()
            .ok_or_else(|| GalaxyError::Unexpected(format!("upload of {name} created no dataset")))
    }

    pub async fn run_tool(&self, req: &ToolRunRequest) -> Result<ToolRunResponse, GalaxyError> {
        self.send_json(self.post("api/tools")?.json(req)).await
    }

    pub async fn job(&self, id: &str) -> Result<JobDetails, GalaxyError> {
        let req = self
            .get(&format!("api/jobs/{id}"))?
            .query(&[("full", "true")]);
        self.send_json(req).await
    }

    pub async fn delete_job(&self, id: &str) -> Result<(), GalaxyError> {
        self.send(self.delete(&format!("api/jobs/{id}"))?).await?;
        Ok(())
    }

    pub async fn download_dataset(
        &self,
        history_id: &str,
        dataset_id: &str,
    ) -> Result<Vec<u8>, GalaxyError> {
        let req = self.get(&format!(
            "api/histories/{history_id}/contents/{dataset_id}/display"
        ))?;
        let response = self.send(req).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn client_for(server: &MockServer) -> GalaxyClient {
        GalaxyClient::new(&server.uri(), 8080, "secret".into()).unwrap()
    }

    #[test]
    fn default_port_is_applied() {
        let client = GalaxyClient::new("http://galaxy.example.org", 8080, "k".into()).unwrap();
        assert_eq!(client.base_url().as_str(), "http://galaxy.example.org:8080/");
        let client = GalaxyClient::new("http://localhost:9090", 8080, "k".into()).unwrap();
        assert_eq!(client.base_url().port(), Some(9090));
        assert!(GalaxyClient::new("not a url", 8080, "k".into()).is_err());

        let client = GalaxyClient::new("https://usegalaxy.example.org/galaxy", 443, "k".into()).unwrap();
        assert_eq!(
            client.url("api/version").unwrap().as_str(),
            "https://usegalaxy.example.org/galaxy/api/version"
        );
    }

    #[tokio::test]
    async fn version_sends_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/version"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version_major": "23.1"})))
            .mount(&server)
            .await;

        let version = client_for(&server).await.version().await.unwrap();
        assert_eq!(version.version_major, "23.1");
    }

    #[tokio::test]
    async fn api_errors_carry_err_msg() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/nope"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"err_msg": "Invalid job id", "err_code": 400008})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).await.job("nope").await.unwrap_err();
        match err {
            GalaxyError::ApiError { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid job id");
            }
            other => panic!("expected ApiError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn histories_are_filtered_by_exact_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/histories"))
            .and(query_param("qv", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "h1", "name": "abc"},
                {"id": "h2", "name": "abcdef"},
                {"id": "h3", "name": "abc", "deleted": true}
            ])))
            .mount(&server)
            .await;

        let histories = client_for(&server).await.histories_named("abc").await.unwrap();
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].id, "h1");
    }

    #[tokio::test]
    async fn delete_history_purges_when_asked() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/histories/h1"))
            .and(query_param("purge", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "h1"})))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).await.delete_history("h1", true).await.unwrap();
    }

    #[tokio::test]
    async fn network_failure_is_transient() {
        let client = GalaxyClient::new("http://127.0.0.1:1", 8080, "k".into()).unwrap();
        let err = client.version().await.unwrap_err();
        assert!(matches!(err, GalaxyError::NetworkError(_)));
        assert!(err.is_transient());
    }
}
