//! Google Cloud Storage backend over the GCS JSON API.
//!
//! Objects are uploaded with the `publicRead` predefined ACL so their public
//! URL (`https://storage.googleapis.com/{bucket}/{key}`) is retrievable
//! without credentials.
//!
//! Access tokens are resolved in this order:
//!   - no token at all when an emulator endpoint is configured
//!   - `GOOGLE_OAUTH_ACCESS_TOKEN`
//!   - the credentials file (`service_account` or `authorized_user`)
//!   - the GCE metadata server

use super::{BlobStore, StorageError};
use bytes::Bytes;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{RequestBuilder, Response, StatusCode, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};
use tracing::{debug, info};

const GCS_HOST: &str = "https://storage.googleapis.com";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Object names go into a single path segment of the JSON API.
const OBJECT_SEGMENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Public URLs keep `/` so keys read like paths, as GCS itself renders them.
const PUBLIC_PATH_SET: &AsciiSet = &OBJECT_SEGMENT_SET.remove(b'/');

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GcsListResponse {
    items: Option<Vec<GcsObject>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount {
        client_email: String,
        private_key: String,
        token_uri: Option<String>,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// A bucket in Google Cloud Storage.
#[derive(Debug)]
pub struct GcsBucket {
    client: reqwest::Client,
    bucket: String,
    credentials_file: Option<PathBuf>,
    /// Base URL of the API; `None` means the real service.
    emulator_host: Option<String>,
    token_cache: Mutex<Option<CachedToken>>,
}

impl GcsBucket {
    /// Creates a client for `bucket`.
    ///
    /// Credentials are resolved lazily on the first call that needs them.
    pub fn new(
        bucket: String,
        credentials_file: Option<PathBuf>,
        emulator_host: Option<String>,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| StorageError::Http {
                key: bucket.clone(),
                source: e,
            })?;

        info!(
            bucket = %bucket,
            emulator = emulator_host.as_deref().unwrap_or("none"),
            "GCS bucket client initialized"
        );

        Ok(Self {
            client,
            bucket,
            credentials_file,
            emulator_host,
            token_cache: Mutex::new(None),
        })
    }

    fn api_base(&self) -> &str {
        self.emulator_host
            .as_deref()
            .unwrap_or(GCS_HOST)
            .trim_end_matches('/')
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.api_base(),
            self.bucket,
            utf8_percent_encode(key, OBJECT_SEGMENT_SET)
        )
    }

    /// Attaches a bearer token unless talking to an emulator.
    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, StorageError> {
        if self.emulator_host.is_some() {
            return Ok(request);
        }
        let token = self.access_token().await?;
        Ok(request.bearer_auth(token))
    }

    async fn access_token(&self) -> Result<String, StorageError> {
        {
            let cache = self
                .token_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.as_ref() {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let token = self.fetch_access_token().await?;
        let lifetime = token.expires_in.unwrap_or(3600).saturating_sub(60);

        let mut cache = self
            .token_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cache = Some(CachedToken {
            access_token: token.access_token.clone(),
            expiry: Instant::now() + Duration::from_secs(lifetime),
        });

        Ok(token.access_token)
    }

    async fn fetch_access_token(&self) -> Result<TokenResponse, StorageError> {
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok(TokenResponse {
                access_token: token,
                expires_in: None,
            });
        }

        let Some(path) = &self.credentials_file else {
            debug!("no credentials file configured, asking the metadata server");
            return self
                .token_request(
                    self.client
                        .get(METADATA_TOKEN_URL)
                        .header("Metadata-Flavor", "Google")
                        .timeout(Duration::from_secs(5)),
                )
                .await;
        };

        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            StorageError::Credentials(format!("cannot read {}: {e}", path.display()))
        })?;
        let credentials: CredentialsFile = serde_json::from_str(&contents).map_err(|e| {
            StorageError::Credentials(format!("cannot parse {}: {e}", path.display()))
        })?;

        match credentials {
            CredentialsFile::ServiceAccount {
                client_email,
                private_key,
                token_uri,
            } => {
                let token_uri = token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
                let assertion = sign_assertion(&client_email, &private_key, token_uri)?;
                self.token_request(self.client.post(token_uri).form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ]))
                .await
            }
            CredentialsFile::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            } => {
                self.token_request(self.client.post(DEFAULT_TOKEN_URI).form(&[
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("refresh_token", refresh_token.as_str()),
                    ("grant_type", "refresh_token"),
                ]))
                .await
            }
        }
    }

    async fn token_request(&self, request: RequestBuilder) -> Result<TokenResponse, StorageError> {
        let resp = request
            .send()
            .await
            .map_err(|e| StorageError::Credentials(format!("token request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Credentials(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        resp.json()
            .await
            .map_err(|e| StorageError::Credentials(format!("unreadable token response: {e}")))
    }
}

impl BlobStore for GcsBucket {
    async fn put(
        &self,
        key: &str,
        content: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let url = format!("{}/upload/storage/v1/b/{}/o", self.api_base(), self.bucket);
        let request = self
            .client
            .post(url)
            .query(&[
                ("uploadType", "media"),
                ("name", key),
                ("predefinedAcl", "publicRead"),
            ])
            .header(CONTENT_TYPE, content_type)
            .body(content);

        let resp = send(key, self.authorized(request).await?).await?;
        check(key, resp).await?;
        debug!(key, "uploaded object");

        Ok(self.public_url(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let request = self.client.delete(self.object_url(key));

        let resp = send(key, self.authorized(request).await?).await?;
        check(key, resp).await?;

        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let url = format!("{}/storage/v1/b/{}/o", self.api_base(), self.bucket);
        let mut keys = vec![];
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .query(&[("fields", "items(name),nextPageToken")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let resp = send(&self.bucket, self.authorized(request).await?).await?;
            let page: GcsListResponse = check(&self.bucket, resp)
                .await?
                .json()
                .await
                .map_err(|e| StorageError::Http {
                    key: self.bucket.clone(),
                    source: e,
                })?;

            keys.extend(page.items.unwrap_or_default().into_iter().map(|o| o.name));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.api_base(),
            self.bucket,
            utf8_percent_encode(key, PUBLIC_PATH_SET)
        )
    }
}

async fn send(key: &str, request: RequestBuilder) -> Result<Response, StorageError> {
    request.send().await.map_err(|e| StorageError::Http {
        key: key.to_string(),
        source: e,
    })
}

/// Maps a non-success GCS response onto a [`StorageError`].
async fn check(key: &str, resp: Response) -> Result<Response, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound {
            key: key.to_string(),
        });
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<GcsErrorResponse>(&body)
        .ok()
        .and_then(|e| e.error)
        .and_then(|e| e.message)
        .unwrap_or(body);

    Err(StorageError::Rejected {
        key: key.to_string(),
        status: status.as_u16(),
        message,
    })
}

/// Signs the JWT bearer assertion for the service-account token exchange.
fn sign_assertion(
    client_email: &str,
    private_key: &str,
    token_uri: &str,
) -> Result<String, StorageError> {
    let now = Utc::now().timestamp();
    let claims = JwtClaims {
        iss: client_email,
        scope: STORAGE_SCOPE,
        aud: token_uri,
        iat: now,
        exp: now + 3600,
    };

    let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
        .map_err(|e| StorageError::Credentials(format!("invalid private key: {e}")))?;

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| StorageError::Credentials(format!("cannot sign assertion: {e}")))
}

#[cfg(test)]
mod tests {
    use super::{CredentialsFile, GcsBucket};
    use crate::storage::{BlobStore, StorageError};

    fn get_bucket(emulator: Option<&str>) -> GcsBucket {
        GcsBucket::new(
            "my-images".to_string(),
            None,
            emulator.map(str::to_string),
        )
        .unwrap()
    }

    #[test]
    fn test_public_url() {
        let bucket = get_bucket(None);

        assert_eq!(
            "https://storage.googleapis.com/my-images/cat.png",
            bucket.public_url("cat.png")
        );
        assert_eq!(
            "https://storage.googleapis.com/my-images/albums/my%20cat.png",
            bucket.public_url("albums/my cat.png")
        );
    }

    #[test]
    fn test_emulator_urls() {
        let bucket = get_bucket(Some("http://localhost:4443/"));

        assert_eq!(
            "http://localhost:4443/my-images/cat.png",
            bucket.public_url("cat.png")
        );
        assert_eq!(
            "http://localhost:4443/storage/v1/b/my-images/o/albums%2Fcat.png",
            bucket.object_url("albums/cat.png")
        );
    }

    #[test]
    fn test_parse_credentials_file() {
        let user = r#"{"type":"authorized_user","client_id":"id","client_secret":"secret","refresh_token":"rt"}"#;
        assert!(matches!(
            serde_json::from_str::<CredentialsFile>(user).unwrap(),
            CredentialsFile::AuthorizedUser { .. }
        ));

        let account = r#"{"type":"service_account","client_email":"svc@example.iam.gserviceaccount.com","private_key":"pem"}"#;
        let CredentialsFile::ServiceAccount { token_uri, .. } =
            serde_json::from_str::<CredentialsFile>(account).unwrap()
        else {
            panic!("expected service account credentials");
        };
        assert_eq!(None, token_uri);
    }

    #[test]
    fn test_sign_assertion_rejects_bad_key() {
        let result = super::sign_assertion("svc@example.com", "not a pem", super::DEFAULT_TOKEN_URI);
        assert!(matches!(result, Err(StorageError::Credentials(_))));
    }
}
