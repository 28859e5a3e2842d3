use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("file {0} not found in store")]
    NotFound(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Content-addressed file store contract (the controller's file cache).
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn fetch(&self, hash: &str) -> Result<Vec<u8>, FileStoreError>;
}

pub struct HttpFileStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFileStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FileStore for HttpFileStore {
    async fn fetch(&self, hash: &str) -> Result<Vec<u8>, FileStoreError> {
        let url = format!("{}/api/v1/files/{hash}", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FileStoreError::Transport(e.into()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FileStoreError::NotFound(hash.to_string()));
        }

        let response = response
            .error_for_status()
            .map_err(|e| FileStoreError::Transport(e.into()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FileStoreError::Transport(e.into()))?;
        Ok(bytes.to_vec())
    }
}
