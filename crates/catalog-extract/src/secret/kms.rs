//! Cloud KMS REST client.

use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::{KeyManagementClient, KeyReference};
use crate::deferred::DeferredValue;
use crate::error::BoxError;

/// Default Cloud KMS REST endpoint.
pub const DEFAULT_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";

#[derive(Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

/// Decrypts through `POST {endpoint}/{key}:decrypt`.
///
/// The OAuth access token is itself a deferred value, resolved on the first
/// decrypt and reused for the lifetime of the client.
#[derive(Debug)]
pub struct CloudKmsClient {
    http: reqwest::Client,
    endpoint: String,
    access_token: DeferredValue<String>,
}

impl CloudKmsClient {
    pub fn new(endpoint: impl Into<String>, access_token: DeferredValue<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn decrypt_url(&self, key: &KeyReference) -> String {
        format!("{}/{}:decrypt", self.endpoint, key.as_str().trim_start_matches('/'))
    }
}

#[async_trait]
impl KeyManagementClient for CloudKmsClient {
    async fn decrypt(
        &self,
        key: &KeyReference,
        ciphertext: &[u8],
    ) -> Result<SecretString, BoxError> {
        let token = self.access_token.resolve().await?;
        let encoded = BASE64_STANDARD.encode(ciphertext);

        let response = self
            .http
            .post(self.decrypt_url(key))
            .bearer_auth(token)
            .json(&DecryptRequest {
                ciphertext: &encoded,
            })
            .send()
            .await?
            .error_for_status()?;

        let body: DecryptResponse = response.json().await?;
        let bytes = BASE64_STANDARD.decode(body.plaintext)?;
        Ok(SecretString::from(String::from_utf8(bytes)?))
    }
}
