//! Matrix login interception
//!
//! Password logins are handled here instead of by synapse: the password
//! is checked against the homeserver's user table and a pair of macaroon
//! tokens is minted and persisted. Every other login flow, and every
//! non-POST request, is proxied through to synapse untouched.

use crate::db::LoginDatabase;
use crate::error::{
    full_body, log_and_reply_error, matrix_headers, ErrCode, HttpError, ProxyBody,
};
use crate::macaroons::Macaroon;
use crate::proxy::SynapseProxy;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOGIN_TYPE_PASSWORD: &str = "m.login.password";

/// How long minted access tokens are valid for.
const ACCESS_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default, Deserialize)]
struct LoginRequest {
    #[serde(rename = "type", default)]
    login_type: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub home_server: String,
    pub user_id: String,
}

/// Handles matrix login requests either using the database or by
/// proxying the request to synapse.
pub struct LoginHandler {
    db: Arc<dyn LoginDatabase>,
    proxy: Arc<SynapseProxy>,
    server_name: String,
    macaroon_secret: String,
}

impl LoginHandler {
    pub fn new(
        db: Arc<dyn LoginDatabase>,
        proxy: Arc<SynapseProxy>,
        server_name: impl Into<String>,
        macaroon_secret: impl Into<String>,
    ) -> Self {
        Self {
            db,
            proxy,
            server_name: server_name.into(),
            macaroon_secret: macaroon_secret.into(),
        }
    }

    pub async fn serve(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() != Method::POST {
            return self.proxy.serve(req).await;
        }

        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                return log_and_reply_error(&HttpError::new(
                    err,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrCode::Unknown,
                    "Error reading request",
                ));
            }
        };

        let login: LoginRequest = match serde_json::from_slice(&body) {
            Ok(login) => login,
            Err(err) => {
                return log_and_reply_error(&HttpError::new(
                    err,
                    StatusCode::BAD_REQUEST,
                    ErrCode::BadJson,
                    "Error decoding JSON",
                ));
            }
        };

        if login.login_type.as_deref() == Some(LOGIN_TYPE_PASSWORD) {
            let user = login.user.unwrap_or_default();
            let password = login.password.unwrap_or_default();
            match self.login_password(&user, &password) {
                Ok(response) => {
                    let json = match serde_json::to_vec(&response) {
                        Ok(json) => json,
                        Err(err) => {
                            return log_and_reply_error(&HttpError::new(
                                err,
                                StatusCode::INTERNAL_SERVER_ERROR,
                                ErrCode::Unknown,
                                "Error generating login",
                            ));
                        }
                    };
                    matrix_headers(Response::builder().status(StatusCode::OK))
                        .body(full_body(json))
                        .expect("valid response with static headers")
                }
                Err(http_error) => log_and_reply_error(&http_error),
            }
        } else {
            // Unknown login flows still work: replay the buffered body
            // to synapse.
            let content_length = Some(body.len() as u64);
            self.proxy
                .proxy_http(
                    parts.method,
                    &path_and_query,
                    &parts.headers,
                    full_body(body),
                    content_length,
                )
                .await
        }
    }

    fn login_password(&self, user_id: &str, password: &str) -> Result<LoginResponse, HttpError> {
        let user_id = if user_id.starts_with('@') {
            user_id.to_owned()
        } else {
            format!("@{}:{}", user_id, self.server_name)
        };

        let (canonical_user_id, hash) = self
            .db
            .canonical_user_id_and_password_hash(&user_id)
            .map_err(|err| {
                HttpError::new(err, StatusCode::FORBIDDEN, ErrCode::Forbidden, "Forbidden")
            })?;

        match bcrypt::verify(password, &hash) {
            Ok(true) => {}
            Ok(false) => {
                return Err(HttpError::new(
                    anyhow::anyhow!("password mismatch for {:?}", canonical_user_id),
                    StatusCode::FORBIDDEN,
                    ErrCode::Forbidden,
                    "Forbidden",
                ));
            }
            Err(err) => {
                return Err(HttpError::new(
                    err,
                    StatusCode::FORBIDDEN,
                    ErrCode::Forbidden,
                    "Forbidden",
                ));
            }
        }

        let expires = SystemTime::now() + ACCESS_TOKEN_LIFETIME;
        let nonce = random_base64(8);

        let response = self
            .make_login_response(&canonical_user_id, expires, &nonce)
            .map_err(|err| {
                HttpError::new(
                    err,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrCode::Unknown,
                    "Error generating login",
                )
            })?;

        self.db
            .insert_tokens(
                &response.user_id,
                &response.access_token,
                &response.refresh_token,
            )
            .map_err(|err| {
                HttpError::new(
                    err,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrCode::Unknown,
                    "Error persisting login",
                )
            })?;

        Ok(response)
    }

    fn make_login_response(
        &self,
        user_id: &str,
        expires: SystemTime,
        nonce: &str,
    ) -> anyhow::Result<LoginResponse> {
        let expires_ms = expires
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let mut access_token =
            Macaroon::new(self.macaroon_secret.as_bytes(), "key", &self.server_name);
        access_token.add_first_party_caveat("gen = 1");
        access_token.add_first_party_caveat(&format!("user_id = {}", user_id));
        let mut refresh_token = access_token.clone();

        access_token.add_first_party_caveat("type = access");
        access_token.add_first_party_caveat(&format!("time < {}", expires_ms));

        refresh_token.add_first_party_caveat("type = refresh");
        refresh_token.add_first_party_caveat(&format!("nonce = {}", nonce));

        Ok(LoginResponse {
            access_token: access_token.serialize(),
            refresh_token: refresh_token.serialize(),
            home_server: self.server_name.clone(),
            user_id: user_id.to_owned(),
        })
    }
}

fn random_base64(count: usize) -> String {
    let mut bytes = vec![0u8; count];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
