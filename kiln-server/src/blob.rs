//! Local-filesystem blob store.
//!
//! Artifacts land under a flat directory with UUID filenames and are served
//! back by the HTTP server at the configured public base URL. Suitable for
//! single-node deployments; object storage slots in behind the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use kiln_core::{BlobError, BlobStore};

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    /// Create the store, making sure the root directory exists.
    pub async fn open(root: impl Into<PathBuf>, public_base_url: &str) -> Result<Self, BlobError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| BlobError(format!("creating blob dir: {e}")))?;
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put_stream(
        &self,
        ext: &str,
        mut stream: BoxStream<'static, Result<Bytes, BlobError>>,
    ) -> Result<String, BlobError> {
        let name = format!("{}{ext}", Uuid::new_v4());
        let path = self.root.join(&name);

        // Write to a .part file and rename so readers never see a partial
        // artifact at the final name.
        let partial = self.root.join(format!("{name}.part"));
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| BlobError(format!("creating {}: {e}", partial.display())))?;

        let result: Result<(), BlobError> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| BlobError(format!("writing artifact: {e}")))?;
            }
            file.flush()
                .await
                .map_err(|e| BlobError(format!("flushing artifact: {e}")))?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| BlobError(format!("renaming artifact: {e}")))?;

        Ok(format!("{}/{name}", self.public_base_url))
    }

    fn owns_url(&self, url: &str) -> bool {
        url.starts_with(&self.public_base_url)
    }
}
