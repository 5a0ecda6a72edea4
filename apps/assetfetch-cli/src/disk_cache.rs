use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use assetfetch_core::{AssetCache, AssetId, CacheError, CacheKey, CacheRead};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

// Entries start with the asset's total size (0 = unknown), little endian.
const HEADER_LEN: u64 = 8;

/// One file per asset under a cache directory.
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating cache directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn entry_path(&self, id: &AssetId) -> PathBuf {
        self.dir.join(format!("{id}.asset"))
    }

    async fn read_entry(path: &Path, offset: usize, size: usize) -> Result<CacheRead, CacheError> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(CacheError::Miss),
            Err(err) => return Err(err.into()),
        };
        let stored = file.metadata().await?.len();
        if stored < HEADER_LEN {
            return Err(CacheError::Corrupt(format!("{} is truncated", path.display())));
        }
        let file_size = file.read_u64_le().await? as usize;
        let available = (stored - HEADER_LEN) as usize;
        if offset >= available {
            return Err(CacheError::Miss);
        }
        let len = size.min(available - offset);
        file.seek(SeekFrom::Start(HEADER_LEN + offset as u64)).await?;
        let mut data = BytesMut::zeroed(len);
        file.read_exact(&mut data).await?;
        Ok(CacheRead {
            data: data.freeze(),
            file_size,
            local: false,
        })
    }

    async fn read_local(path: &Path, offset: usize, size: usize) -> Result<CacheRead, CacheError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => Bytes::from(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(CacheError::Miss),
            Err(err) => return Err(err.into()),
        };
        let file_size = data.len();
        if offset >= file_size {
            return Err(CacheError::Miss);
        }
        let end = offset.saturating_add(size).min(file_size);
        Ok(CacheRead {
            data: data.slice(offset..end),
            file_size,
            local: true,
        })
    }
}

#[async_trait]
impl AssetCache for DiskCache {
    async fn read(
        &self,
        key: &CacheKey,
        offset: usize,
        size: usize,
    ) -> Result<CacheRead, CacheError> {
        trace!(target: "assetfetch::cache", key = %key, offset, size, "read");
        match key {
            CacheKey::Asset(id) => Self::read_entry(&self.entry_path(id), offset, size).await,
            CacheKey::LocalFile(path) => Self::read_local(path, offset, size).await,
        }
    }

    async fn write(
        &self,
        key: &CacheKey,
        data: Bytes,
        total_size_hint: usize,
    ) -> Result<(), CacheError> {
        let CacheKey::Asset(id) = key else {
            return Err(CacheError::Corrupt(format!("{key} is not writable")));
        };
        let path = self.entry_path(id);
        let tmp = path.with_extension("asset.tmp");
        // A hint past the data means the asset is incomplete; store it as is
        // so a later read knows to continue from the network.
        let file_size = if total_size_hint > data.len() {
            0
        } else {
            total_size_hint
        };
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_u64_le(file_size as u64).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        trace!(target: "assetfetch::cache", key = %key, bytes = data.len(), file_size, "write");
        Ok(())
    }

    fn remove(&self, key: &CacheKey) {
        if let CacheKey::Asset(id) = key {
            let _ = std::fs::remove_file(self.entry_path(id));
        }
    }
}
