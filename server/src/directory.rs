use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::DirectoryError;

/// Knows which session identifiers exist as persisted interview records.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn exists(&self, session_id: &str) -> Result<bool, DirectoryError>;
}

/// Accepts every session identifier.
pub struct OpenDirectory;

#[async_trait]
impl SessionDirectory for OpenDirectory {
    async fn exists(&self, _: &str) -> Result<bool, DirectoryError> {
        Ok(true)
    }
}

pub struct HttpSessionDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionDirectory {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl SessionDirectory for HttpSessionDirectory {
    async fn exists(&self, session_id: &str) -> Result<bool, DirectoryError> {
        let url = format!("{}/{}", self.base_url, urlencoding::encode(session_id));
        let response = self.client.get(url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(DirectoryError::Status(status.as_u16())),
        }
    }
}

/// Lookup failures count as "exists" so an outage never blocks a live interview.
pub async fn session_exists(directory: &dyn SessionDirectory, session_id: &str) -> bool {
    match directory.exists(session_id).await {
        Ok(exists) => exists,
        Err(e) => {
            log::warn!("Session directory lookup for {} failed: {}", session_id, e);
            true
        }
    }
}
