use actix_web::error::ErrorUnauthorized;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, Error, HttpRequest};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use system::Identity;

use crate::error::VerifyError;

/// Resolves a bearer token to the identity it was issued to.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, VerifyError>;
}

pub struct HttpTokenVerifier {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpTokenVerifier {
    pub fn new(verify_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            verify_url: verify_url.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
        let response = self
            .client
            .get(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<Identity>().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(VerifyError::Rejected),
            status => Err(VerifyError::Status(status.as_u16())),
        }
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `Authorization: Bearer <token>` wins over a `?token=` query parameter.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_owned());

    from_header
        .or_else(|| {
            web::Query::<TokenQuery>::from_query(req.query_string())
                .ok()
                .and_then(|q| q.into_inner().token)
        })
        .filter(|t| !t.is_empty())
}

pub async fn authenticate(
    req: &HttpRequest,
    verifier: &dyn TokenVerifier,
) -> Result<Identity, Error> {
    let token = bearer_token(req).ok_or_else(|| ErrorUnauthorized("missing bearer token"))?;
    match verifier.verify(&token).await {
        Ok(identity) => Ok(identity),
        Err(e) => {
            log::info!("Refusing connection from {:?}: {}", req.peer_addr(), e);
            Err(ErrorUnauthorized("invalid bearer token"))
        }
    }
}
