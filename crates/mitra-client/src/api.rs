use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use mitra_types::api::{
    AttendanceRequest, CreateRegistrationRequest, ErrorBody, ExitQrResponse, ExitResponse,
    InTimeRequest, OutTimeRequest, RegistrationEnvelope, UploadResponse,
};
use mitra_types::models::{AttendanceStats, Message, Registration};
use mitra_types::rules::PAGE_SIZE;

use crate::attendance::is_exit_token;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::upload::{PendingFile, UploadProgress, upload_stream};

/// Chat endpoints a session needs besides the socket.
pub trait ChatApi: Send + Sync {
    /// One history page, oldest first. `before` is a message id cursor.
    fn fetch_messages(
        &self,
        event_id: Uuid,
        before: Option<Uuid>,
    ) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send;

    fn fetch_pinned(
        &self,
        event_id: Uuid,
    ) -> impl Future<Output = Result<Option<Message>, ClientError>> + Send;

    fn upload(
        &self,
        file: &PendingFile,
        progress: Arc<UploadProgress>,
    ) -> impl Future<Output = Result<UploadResponse, ClientError>> + Send;
}

/// Registration and attendance endpoints.
pub trait AttendanceApi: Send + Sync {
    fn register(
        &self,
        event_id: Uuid,
    ) -> impl Future<Output = Result<Registration, ClientError>> + Send;

    fn fetch_registrations(
        &self,
        event_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Registration>, ClientError>> + Send;

    fn fetch_exit_qr(
        &self,
        registration_id: Uuid,
    ) -> impl Future<Output = Result<String, ClientError>> + Send;

    fn mark_attendance(
        &self,
        registration_id: Uuid,
        has_attended: bool,
    ) -> impl Future<Output = Result<Registration, ClientError>> + Send;

    fn scan_exit(
        &self,
        exit_qr_token: &str,
    ) -> impl Future<Output = Result<ExitResponse, ClientError>> + Send;

    fn set_in_time(
        &self,
        registration_id: Uuid,
        in_time: DateTime<Utc>,
    ) -> impl Future<Output = Result<Registration, ClientError>> + Send;

    fn set_out_time(
        &self,
        registration_id: Uuid,
        out_time: DateTime<Utc>,
    ) -> impl Future<Output = Result<Registration, ClientError>> + Send;

    fn fetch_stats(
        &self,
        event_id: Uuid,
    ) -> impl Future<Output = Result<AttendanceStats, ClientError>> + Send;
}

/// REST client over reqwest. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    config: ClientConfig,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(self.config.api_url(path))
            .bearer_auth(&self.config.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(self.config.api_url(path))
            .bearer_auth(&self.config.token)
    }

    /// `/api/registrations/exit/{token}` with the token as one encoded path
    /// segment.
    fn exit_url(&self, token: &str) -> Result<Url, ClientError> {
        let bad_base = || ClientError::Validation(format!("bad server url {}", self.config.base_url));
        let mut url = Url::parse(&self.config.api_url("/api/registrations/exit"))
            .map_err(|_| bad_base())?;
        url.path_segments_mut().map_err(|_| bad_base())?.push(token);
        Ok(url)
    }

    fn patch(&self, path: &str) -> RequestBuilder {
        self.http
            .patch(self.config.api_url(path))
            .bearer_auth(&self.config.token)
    }
}

/// Decode a success body, or turn the `{error, message}` body into a
/// [`ClientError`].
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()));
    }
    let body = resp.json::<ErrorBody>().await.ok();
    let err = ClientError::from_status(status.as_u16(), body);
    debug!("Request failed with {}: {}", status, err);
    Err(err)
}

impl ChatApi for ApiClient {
    async fn fetch_messages(
        &self,
        event_id: Uuid,
        before: Option<Uuid>,
    ) -> Result<Vec<Message>, ClientError> {
        let mut query = vec![("limit", PAGE_SIZE.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        let resp = self
            .get(&format!("/api/chatbox/events/{event_id}/messages"))
            .query(&query)
            .send()
            .await?;
        decode(resp).await
    }

    async fn fetch_pinned(&self, event_id: Uuid) -> Result<Option<Message>, ClientError> {
        let resp = self
            .get(&format!("/api/chatbox/events/{event_id}/pinned"))
            .send()
            .await?;
        decode(resp).await
    }

    async fn upload(
        &self,
        file: &PendingFile,
        progress: Arc<UploadProgress>,
    ) -> Result<UploadResponse, ClientError> {
        file.validate()?;

        let body = Body::wrap_stream(upload_stream(file.data.clone(), progress.clone()));
        let part = Part::stream_with_length(body, file.size())
            .file_name(file.filename.clone())
            .mime_str(&file.mime_type)?;
        let form = Form::new().part("file", part);

        let sent = self.post("/api/chatbox/upload").multipart(form).send().await;
        if progress.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let resp = sent.inspect_err(|e| warn!("Upload of {} failed: {}", file.filename, e))?;
        decode(resp).await
    }
}

impl AttendanceApi for ApiClient {
    async fn register(&self, event_id: Uuid) -> Result<Registration, ClientError> {
        let resp = self
            .post("/api/registrations")
            .json(&CreateRegistrationRequest { event_id })
            .send()
            .await?;
        decode::<RegistrationEnvelope>(resp)
            .await
            .map(|e| e.registration)
    }

    async fn fetch_registrations(&self, event_id: Uuid) -> Result<Vec<Registration>, ClientError> {
        let resp = self
            .get(&format!("/api/registrations/event/{event_id}"))
            .send()
            .await?;
        decode(resp).await
    }

    async fn fetch_exit_qr(&self, registration_id: Uuid) -> Result<String, ClientError> {
        let resp = self
            .get(&format!("/api/registrations/{registration_id}/exit-qr"))
            .send()
            .await?;
        decode::<ExitQrResponse>(resp)
            .await
            .map(|r| r.exit_qr_token)
    }

    async fn mark_attendance(
        &self,
        registration_id: Uuid,
        has_attended: bool,
    ) -> Result<Registration, ClientError> {
        let resp = self
            .patch(&format!("/api/registrations/{registration_id}/attendance"))
            .json(&AttendanceRequest { has_attended })
            .send()
            .await?;
        decode::<RegistrationEnvelope>(resp)
            .await
            .map(|e| e.registration)
    }

    async fn scan_exit(&self, exit_qr_token: &str) -> Result<ExitResponse, ClientError> {
        if !is_exit_token(exit_qr_token) {
            return Err(ClientError::Validation("malformed exit token".into()));
        }
        let resp = self
            .http
            .post(self.exit_url(exit_qr_token)?)
            .bearer_auth(&self.config.token)
            .send()
            .await?;
        decode(resp).await
    }

    async fn set_in_time(
        &self,
        registration_id: Uuid,
        in_time: DateTime<Utc>,
    ) -> Result<Registration, ClientError> {
        let resp = self
            .patch(&format!("/api/registrations/{registration_id}/in-time"))
            .json(&InTimeRequest { in_time })
            .send()
            .await?;
        decode::<RegistrationEnvelope>(resp)
            .await
            .map(|e| e.registration)
    }

    async fn set_out_time(
        &self,
        registration_id: Uuid,
        out_time: DateTime<Utc>,
    ) -> Result<Registration, ClientError> {
        let resp = self
            .patch(&format!("/api/registrations/{registration_id}/out-time"))
            .json(&OutTimeRequest { out_time })
            .send()
            .await?;
        decode::<RegistrationEnvelope>(resp)
            .await
            .map(|e| e.registration)
    }

    async fn fetch_stats(&self, event_id: Uuid) -> Result<AttendanceStats, ClientError> {
        let resp = self
            .get(&format!("/api/registrations/event/{event_id}/stats"))
            .send()
            .await?;
        decode(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversize_upload_never_reaches_the_network() {
        // nothing listens here; a request would fail with a network error
        let api = ApiClient::new(ClientConfig::new("http://127.0.0.1:1", "token")).unwrap();
        let file = PendingFile::new("big.pdf", "application/pdf", vec![0u8; 11 * 1024 * 1024]);
        let progress = Arc::new(UploadProgress::new(file.size()));

        let err = api.upload(&file, progress.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::FileTooLarge));
        assert_eq!(progress.bytes_sent(), 0);
    }

    #[test]
    fn exit_token_stays_one_path_segment() {
        let api = ApiClient::new(ClientConfig::new("https://mitra.example.org/", "token")).unwrap();
        let url = api.exit_url("aB3-_x").unwrap();
        assert_eq!(url.as_str(), "https://mitra.example.org/api/registrations/exit/aB3-_x");

        for (token, path) in [
            ("abc#frag", "/api/registrations/exit/abc%23frag"),
            ("abc?x=1", "/api/registrations/exit/abc%3Fx=1"),
            ("x/y", "/api/registrations/exit/x%2Fy"),
        ] {
            let url = api.exit_url(token).unwrap();
            assert_eq!(url.path(), path, "{token}");
            assert_eq!(url.query(), None);
            assert_eq!(url.fragment(), None);
        }
    }

    #[tokio::test]
    async fn malformed_exit_token_is_refused_locally() {
        let api = ApiClient::new(ClientConfig::new("http://127.0.0.1:1", "token")).unwrap();
        for token in ["x/../../attendance", "abc#frag", ""] {
            let err = api.scan_exit(token).await.unwrap_err();
            assert!(matches!(err, ClientError::Validation(_)), "{token}: {err:?}");
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let api = ApiClient::new(ClientConfig::new("http://127.0.0.1:1", "token")).unwrap();
        let err = api.fetch_stats(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ClientError::Network(_)));
        assert!(err.is_retryable());
    }
}
