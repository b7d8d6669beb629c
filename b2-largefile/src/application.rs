use std::env::VarError;
use std::fmt;

use api_client::uri::UriExtension as _;
use api_client::{ApiClient, RequestExt as _, Secret};
use http::{HeaderValue, Method, Request, StatusCode, Uri};
use hyperdriver::Body;
use serde::{Deserialize, Serialize};

use crate::errors::{B2ResponseExt as _, B2RequestError};
use crate::B2_API_VERSION;

const B2_KEY_ID_ENV: &str = "B2_KEY_ID";
const B2_KEY_ENV: &str = "B2_KEY";

/// B2 Application Key, which consists of an ID and a secret key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct B2ApplicationKey {
    key_id: Secret,
    key: Secret,
}

impl B2ApplicationKey {
    /// Create a new B2 Application Key.
    pub fn new(key_id: Secret, key: Secret) -> Self {
        if key_id.is_empty() {
            tracing::warn!("B2 key id is empty");
        }

        if !key.revealed().starts_with('K') {
            tracing::warn!("B2 key does not start with K");
        }

        Self { key_id, key }
    }

    /// Load the B2 Application Key from the `B2_KEY_ID` and `B2_KEY` environment variables.
    pub fn from_env() -> Result<Self, VarError> {
        let key_id = Secret::from_env(B2_KEY_ID_ENV)?;
        let key = Secret::from_env(B2_KEY_ENV)?;

        Ok(B2ApplicationKey::new(key_id, key))
    }

    #[cfg(test)]
    pub(crate) fn test() -> Self {
        B2ApplicationKey::new(
            Secret::from("001B2-key-id-test"),
            Secret::from("K001B2-key-test"),
        )
    }

    /// Get the Key, this is the secret part of the authentication pair.
    pub fn key(&self) -> &Secret {
        &self.key
    }

    /// Get the key ID, this is the less secret part of the authentication pair.
    pub fn key_id(&self) -> &Secret {
        &self.key_id
    }

    /// Exchange the key for a fresh authorization.
    ///
    /// The request carries HTTP basic credentials, so any authorization already
    /// installed on `client` is not applied to it.
    #[tracing::instrument(skip_all, fields(url = %authorization_url))]
    pub(crate) async fn fetch_authorization(
        &self,
        client: &ApiClient<B2Authorization>,
        authorization_url: &Uri,
    ) -> Result<B2Authorization, B2RequestError> {
        let request = Request::builder()
            .method(Method::GET)
            .version(http::Version::HTTP_11)
            .uri(
                authorization_url
                    .clone()
                    .join(format!("{B2_API_VERSION}/b2_authorize_account")),
            )
            .basic_auth(self.key_id.revealed(), Some(self.key.revealed()))
            .body(Body::empty())?;

        let auth: B2Authorization = client
            .execute(request)
            .await?
            .deserialize()
            .await
            .map_err(|error| match error {
                B2RequestError::B2(error) | B2RequestError::AuthExpired(error)
                    if matches!(
                        error.status_code(),
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                    ) =>
                {
                    B2RequestError::Credentials(error)
                }
                error => error,
            })?;

        tracing::trace!("Got B2 Authorization: {:#?}", auth);
        Ok(auth)
    }
}

/// Represents the authorization response from the B2 API.
///
/// The token and the URLs it is valid for are always read and replaced together.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct B2Authorization {
    pub(crate) account_id: Secret,
    pub(crate) authorization_token: Secret,

    #[serde(with = "api_client::uri::serde")]
    pub(crate) api_url: Uri,
    #[serde(with = "api_client::uri::serde")]
    pub(crate) download_url: Uri,

    #[serde(default)]
    pub(crate) recommended_part_size: Option<u64>,
    #[serde(default)]
    pub(crate) absolute_minimum_part_size: Option<u64>,
}

impl fmt::Debug for B2Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("B2Authorization")
            .field("account_id", &self.account_id)
            .field("authorization_token", &self.authorization_token)
            .field("api_url", &self.api_url.to_string())
            .field("download_url", &self.download_url.to_string())
            .finish()
    }
}

impl B2Authorization {
    #[cfg(test)]
    pub(crate) fn test() -> Self {
        B2Authorization {
            account_id: Secret::from("b2_account_id"),
            authorization_token: Secret::from("b2_authorization_token"),
            api_url: "https://api.backblazeb2.test".parse().unwrap(),
            download_url: "https://f999.backblazeb2.test".parse().unwrap(),
            recommended_part_size: Some(100_000_000),
            absolute_minimum_part_size: Some(5_000_000),
        }
    }

    /// The account this authorization belongs to.
    pub fn account_id(&self) -> &Secret {
        &self.account_id
    }

    /// The token sent with every API call.
    pub fn authorization_token(&self) -> &Secret {
        &self.authorization_token
    }

    /// Base URL for API calls.
    pub fn api_url(&self) -> &Uri {
        &self.api_url
    }

    /// Base URL for downloads.
    pub fn download_url(&self) -> &Uri {
        &self.download_url
    }

    /// The part size B2 recommends for large files, if it sent one.
    pub fn recommended_part_size(&self) -> Option<u64> {
        self.recommended_part_size
    }

    /// The smallest part size B2 accepts, if it sent one.
    pub fn absolute_minimum_part_size(&self) -> Option<u64> {
        self.absolute_minimum_part_size
    }

    fn endpoint(&self, name: &str) -> Uri {
        self.api_url
            .clone()
            .join(format!("{B2_API_VERSION}/{name}"))
    }

    fn token(&self) -> Result<HeaderValue, http::Error> {
        Ok(self.authorization_token.to_header()?)
    }

    pub(crate) fn post<T: Serialize + ?Sized>(
        &self,
        name: &str,
        body: &T,
    ) -> Result<Request<Body>, B2RequestError> {
        let url = self.endpoint(name);
        tracing::trace!("POST {}", url);

        let body = serde_json::to_string(body)
            .map_err(|error| B2RequestError::Serde(error, name.to_owned()))?;

        let req = Request::builder()
            .method(Method::POST)
            .version(http::Version::HTTP_11)
            .uri(url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .authorization(self.token()?)
            .body(Body::from(body))?;

        Ok(req)
    }
}

impl api_client::Authentication for B2Authorization {
    fn authenticate<B>(&self, req: http::Request<B>) -> http::Request<B> {
        if req.headers().contains_key(http::header::AUTHORIZATION) {
            return req;
        }

        match self.token() {
            Ok(value) => req.authorization(value),
            Err(error) => {
                tracing::error!("B2 authorization token is not a valid header: {error}");
                req
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_client::mock::{MockResponse, MockService};
    use serde_json::json;

    use super::*;
    use crate::errors::ErrorKind;

    fn client(mock: &MockService) -> ApiClient<B2Authorization> {
        ApiClient::new_with_inner_service(mock.clone(), Duration::from_secs(5))
    }

    #[test]
    fn post_builds_versioned_endpoint() {
        let auth = B2Authorization::test();
        let req = auth
            .post("b2_start_large_file", &json!({"bucketId": "bucket"}))
            .unwrap();

        assert_eq!(
            req.uri().to_string(),
            "https://api.backblazeb2.test/b2api/v1/b2_start_large_file"
        );
        assert_eq!(
            req.headers().get(http::header::AUTHORIZATION).unwrap(),
            "b2_authorization_token"
        );
        assert!(req
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .is_sensitive());
    }

    #[test]
    fn authorization_debug_hides_token() {
        let debug = format!("{:?}", B2Authorization::test());
        assert!(!debug.contains("b2_authorization_token"));
        assert!(debug.contains("api.backblazeb2.test"));
    }

    #[tokio::test]
    async fn fetch_authorization_uses_basic_auth() {
        let mock = MockService::new();
        mock.push(
            "/b2api/v1/b2_authorize_account",
            MockResponse::json(
                http::StatusCode::OK,
                &json!({
                    "accountId": "account",
                    "authorizationToken": "token-1",
                    "apiUrl": "https://api001.backblazeb2.test",
                    "downloadUrl": "https://f001.backblazeb2.test",
                    "recommendedPartSize": 100000000,
                    "absoluteMinimumPartSize": 5000000,
                }),
            ),
        );

        let key = B2ApplicationKey::test();
        let url: Uri = "https://auth.backblazeb2.test".parse().unwrap();
        let auth = key.fetch_authorization(&client(&mock), &url).await.unwrap();

        assert_eq!(auth.authorization_token().revealed(), "token-1");
        assert_eq!(auth.api_url().host(), Some("api001.backblazeb2.test"));
        assert_eq!(auth.recommended_part_size(), Some(100_000_000));

        let request = &mock.requests()[0];
        assert_eq!(request.method, http::Method::GET);
        assert!(request.header("authorization").unwrap().starts_with("Basic "));
    }

    #[tokio::test]
    async fn rejected_key_is_a_credentials_error() {
        let mock = MockService::new();
        mock.push(
            "/b2api/v1/b2_authorize_account",
            MockResponse::json(
                http::StatusCode::UNAUTHORIZED,
                &json!({"status": 401, "code": "bad_auth_token", "message": "invalid key"}),
            ),
        );

        let url: Uri = "https://auth.backblazeb2.test".parse().unwrap();
        let error = B2ApplicationKey::test()
            .fetch_authorization(&client(&mock), &url)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Credentials);
    }

    #[tokio::test]
    async fn missing_fields_are_a_protocol_error() {
        let mock = MockService::new();
        mock.push(
            "/b2api/v1/b2_authorize_account",
            MockResponse::json(http::StatusCode::OK, &json!({"accountId": "account"})),
        );

        let url: Uri = "https://auth.backblazeb2.test".parse().unwrap();
        let error = B2ApplicationKey::test()
            .fetch_authorization(&client(&mock), &url)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Protocol);
    }
}
