//! The authorization lifecycle of a B2 account.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use api_client::{ApiClient, Secret};
use http::Uri;
use serde::{de::DeserializeOwned, Serialize};

use crate::application::{B2ApplicationKey, B2Authorization};
use crate::config::{B2Config, UploadSettings};
use crate::errors::{B2RequestError, B2ResponseExt as _};
use crate::file::FileInfo;
use crate::large_file::{LargeFileUploader, StartLargeFile, UploadStatus};
use crate::source::PartSource;

/// A handle on an authorized B2 account.
///
/// Clones share the same authorization, so a token refreshed through one
/// handle is used by all of them. The session starts unauthorized, and is
/// authorized on first use.
#[derive(Debug, Clone)]
pub struct B2Session {
    pub(crate) client: ApiClient<B2Authorization>,
    keys: Arc<B2ApplicationKey>,
    authorization_url: Uri,
    authorizing: Arc<tokio::sync::Mutex<()>>,
}

impl B2Session {
    /// Create a session which connects to B2 over TCP and TLS.
    pub fn new(config: &B2Config) -> Self {
        let client = ApiClient::new(config.timeout, config.connect_timeout);
        Self::from_client(client, config)
    }

    /// Create a session on a custom transport.
    pub fn with_service<S>(config: &B2Config, service: S) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let client = ApiClient::new_with_inner_service(service, config.timeout);
        Self::from_client(client, config)
    }

    fn from_client(client: ApiClient<B2Authorization>, config: &B2Config) -> Self {
        B2Session {
            client,
            keys: Arc::new(config.key.clone()),
            authorization_url: config.authorization_url.clone(),
            authorizing: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The current authorization, if the session holds one.
    pub fn authorization(&self) -> Option<Arc<B2Authorization>> {
        self.client.auth()
    }

    /// Does the session hold an authorization?
    pub fn is_authorized(&self) -> bool {
        self.client.auth().is_some()
    }

    /// The API URL of the current authorization.
    pub fn api_url(&self) -> Option<Uri> {
        self.client.auth().map(|auth| auth.api_url().clone())
    }

    /// The download URL of the current authorization.
    pub fn download_url(&self) -> Option<Uri> {
        self.client.auth().map(|auth| auth.download_url().clone())
    }

    /// The account id of the current authorization.
    pub fn account_id(&self) -> Option<Secret> {
        self.client.auth().map(|auth| auth.account_id().clone())
    }

    /// The timeout applied to each request.
    pub fn timeout(&self) -> Duration {
        self.client.timeout()
    }

    /// The application key this session authorizes with.
    pub fn key(&self) -> &B2ApplicationKey {
        &self.keys
    }

    /// Fetch a new authorization, replacing the current one.
    ///
    /// If the request fails, the current authorization is kept.
    #[tracing::instrument(skip_all)]
    pub async fn authorize(&self) -> Result<Arc<B2Authorization>, B2RequestError> {
        let _guard = self.authorizing.lock().await;
        self.authorize_locked().await
    }

    async fn authorize_locked(&self) -> Result<Arc<B2Authorization>, B2RequestError> {
        tracing::debug!(
            key = self.keys.key_id().revealed(),
            "Refreshing B2 authorization"
        );

        let auth = Arc::new(
            self.keys
                .fetch_authorization(&self.client, &self.authorization_url)
                .await?,
        );
        self.client.refresh_auth(auth.clone());
        Ok(auth)
    }

    /// Return the current authorization, authorizing first if there is none.
    ///
    /// Concurrent callers wait for a single authorization request.
    pub async fn ensure_authorized(&self) -> Result<Arc<B2Authorization>, B2RequestError> {
        if let Some(auth) = self.client.auth() {
            return Ok(auth);
        }

        let _guard = self.authorizing.lock().await;
        if let Some(auth) = self.client.auth() {
            tracing::trace!("authorized while waiting");
            return Ok(auth);
        }

        self.authorize_locked().await
    }

    /// Forget the current authorization.
    pub fn invalidate(&self) {
        tracing::debug!("Invalidating B2 authorization");
        self.client.clear_auth();
    }

    /// Replace an authorization which B2 rejected.
    ///
    /// When another caller has already replaced `stale`, its replacement is
    /// returned without a new request.
    #[tracing::instrument(skip_all)]
    pub async fn reauthorize(
        &self,
        stale: &Arc<B2Authorization>,
    ) -> Result<Arc<B2Authorization>, B2RequestError> {
        let _guard = self.authorizing.lock().await;

        if let Some(current) = self.client.auth() {
            if !Arc::ptr_eq(&current, stale) {
                tracing::trace!("authorization already refreshed");
                return Ok(current);
            }
        }

        self.client.clear_auth();
        self.authorize_locked().await
    }

    /// Run an authenticated operation.
    ///
    /// If B2 rejects the token, the session is re-authorized and the
    /// operation is run one more time. A second rejection is returned.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, B2RequestError>
    where
        F: FnMut(Arc<B2Authorization>) -> Fut,
        Fut: Future<Output = Result<T, B2RequestError>>,
    {
        let auth = self.ensure_authorized().await?;

        match op(auth.clone()).await {
            Err(error) if error.is_auth_expired() => {
                tracing::debug!("B2 authorization expired: {error}");
                let auth = self.reauthorize(&auth).await?;
                op(auth).await
            }
            result => result,
        }
    }

    /// POST a JSON body to an API operation and decode the response.
    pub(crate) async fn api_call<B, T>(&self, name: &str, body: &B) -> Result<T, B2RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call(|auth| async move {
            let request = auth.post(name, body)?;
            self.client.execute(request).await?.deserialize().await
        })
        .await
    }

    /// Upload a large file in one go.
    ///
    /// Runs start, every part, then finish. If anything fails after the file
    /// was started, the large file is cancelled before the error is returned.
    #[tracing::instrument(skip_all, fields(file_name = %request.file_name()))]
    pub async fn upload_large_file(
        &self,
        request: StartLargeFile,
        source: &dyn PartSource,
        settings: UploadSettings,
    ) -> Result<FileInfo, B2RequestError> {
        let mut uploader = LargeFileUploader::new(self.clone(), settings);
        uploader.start(request, source.size()).await?;

        let result = match uploader.upload_all(source).await {
            Ok(()) => uploader.finish().await,
            Err(error) => Err(error),
        };

        if let Err(error) = &result {
            tracing::error!("Error during large file upload: {error}");
            if uploader.status() == UploadStatus::Started {
                if let Err(error) = uploader.cancel().await {
                    tracing::error!("Failed to cancel large file: {error}");
                }
            }
        }

        result
    }
}

impl B2Config {
    /// Create a session with this configuration.
    pub fn session(&self) -> B2Session {
        B2Session::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::file::Action;
    use crate::source::FileSource;
    use crate::testing::{FakeB2, AUTHORIZE, BUCKET, GET_FILE_INFO, START};

    #[tokio::test]
    async fn ensure_authorized_is_idempotent() {
        let fake = FakeB2::new();
        let session = fake.session();
        assert!(!session.is_authorized());

        let first = session.ensure_authorized().await.unwrap();
        let second = session.ensure_authorized().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fake.count(AUTHORIZE), 1);
        assert_eq!(session.api_url(), Some(fake.api_url()));
        assert!(session.download_url().is_some());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_authorization() {
        let fake = FakeB2::new();
        let session = fake.session();

        let other = session.clone();
        let (a, b, c) = tokio::join!(
            session.ensure_authorized(),
            other.ensure_authorized(),
            session.ensure_authorized()
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(fake.count(AUTHORIZE), 1);
    }

    #[tokio::test]
    async fn failed_authorize_keeps_previous_authorization() {
        let fake = FakeB2::new();
        let session = fake.session();
        let before = session.authorize().await.unwrap();

        fake.reject_next_authorize();
        let error = session.authorize().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Credentials);

        let after = session.authorization().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn invalidate_then_authorize_again() {
        let fake = FakeB2::new();
        let session = fake.session();
        let first = session.ensure_authorized().await.unwrap();

        session.invalidate();
        assert!(!session.is_authorized());

        let second = session.ensure_authorized().await.unwrap();
        assert_ne!(
            first.authorization_token().revealed(),
            second.authorization_token().revealed()
        );
        assert_eq!(fake.count(AUTHORIZE), 2);
    }

    #[tokio::test]
    async fn reauthorize_reuses_a_newer_authorization() {
        let fake = FakeB2::new();
        let session = fake.session();
        let stale = session.ensure_authorized().await.unwrap();

        let fresh = session.reauthorize(&stale).await.unwrap();
        let again = session.reauthorize(&stale).await.unwrap();

        assert!(Arc::ptr_eq(&fresh, &again));
        assert_eq!(fake.count(AUTHORIZE), 2);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once() {
        let fake = FakeB2::new();
        let session = fake.session();
        session.ensure_authorized().await.unwrap();

        fake.expire_tokens();
        let info: FileInfo = session
            .api_call(
                "b2_start_large_file",
                &serde_json::json!({
                    "bucketId": BUCKET,
                    "fileName": "refreshed.bin",
                    "contentType": "b2/x-auto",
                }),
            )
            .await
            .unwrap();

        assert_eq!(info.action(), Action::Start);
        assert_eq!(fake.count(AUTHORIZE), 2);
        assert_eq!(fake.count(START), 2);
    }

    #[tokio::test]
    async fn auth_expired_twice_is_surfaced() {
        let fake = FakeB2::new();
        let session = fake.session();
        session.ensure_authorized().await.unwrap();

        fake.always_expire_tokens();
        let error = session
            .api_call::<_, FileInfo>("b2_get_file_info", &serde_json::json!({"fileId": "any"}))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::AuthExpired);
        assert_eq!(fake.count(AUTHORIZE), 2);
        assert_eq!(fake.count(GET_FILE_INFO), 2);
    }

    #[tokio::test]
    async fn upload_large_file_from_disk() {
        let fake = FakeB2::new();
        let session = fake.session();

        let data: Vec<u8> = (0..320u32).map(|i| (i % 256) as u8).collect();
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("backup.tar")).unwrap();
        std::fs::write(&path, &data).unwrap();

        let source = FileSource::open(&path).await.unwrap();
        let info = session
            .upload_large_file(
                StartLargeFile::new(BUCKET, "backups/backup.tar"),
                &source,
                crate::testing::settings(100),
            )
            .await
            .unwrap();

        assert_eq!(info.action(), Action::Upload);
        assert_eq!(info.content_length(), 320);
        assert_eq!(fake.parts(info.id().as_str()).len(), 4);
    }

    #[tokio::test]
    async fn failed_upload_is_cancelled() {
        let fake = FakeB2::new();
        let session = fake.session();
        fake.forget_part(1);

        let source = bytes::Bytes::from(vec![7u8; 150]);
        let error = session
            .upload_large_file(
                StartLargeFile::new(BUCKET, "lost-part.bin"),
                &source,
                crate::testing::settings(100),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Protocol);
        assert_eq!(fake.count(crate::testing::FINISH), 0);
        assert_eq!(fake.count(crate::testing::CANCEL), 1);
        assert_eq!(fake.action("4_zfile0001"), Some("cancelled"));
    }
}
