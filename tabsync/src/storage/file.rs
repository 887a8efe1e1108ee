use super::{StorageArea, StorageChange, StorageError};
use futures::future::{BoxFuture, FutureExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::broadcast;

const CHANGE_CAPACITY: usize = 256;

/// Storage area persisted as one `<key>.json` file per key.
pub struct FileArea {
    dir: PathBuf,
    notifier: broadcast::Sender<StorageChange>,
}

impl FileArea {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;
        let (notifier, _) = broadcast::channel(CHANGE_CAPACITY);

        Ok(Self { dir, notifier })
    }

    /// `<data dir>/tabsync/store`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("tabsync").join("store"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes outside `[A-Za-z0-9.-]` are written as `_XX`, so distinct keys
    /// never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len());
        for byte in key.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => name.push(byte as char),
                _ => name.push_str(&format!("_{:02X}", byte)),
            }
        }
        self.dir.join(format!("{}.json", name))
    }

    async fn write_file(&self, path: &Path, value: &str) -> std::io::Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&tmp, path).await
    }
}

fn unavailable(path: &Path, error: std::io::Error) -> StorageError {
    StorageError::Unavailable(format!("{}: {}", path.display(), error))
}

impl StorageArea for FileArea {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StorageError>> {
        async move {
            let path = self.path_for(key);
            match fs::read_to_string(&path).await {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(unavailable(&path, e)),
            }
        }
        .boxed()
    }

    fn write<'a>(
        &'a self,
        key: &'a str,
        value: Option<String>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            let path = self.path_for(key);
            match value {
                Some(value) => self
                    .write_file(&path, &value)
                    .await
                    .map_err(|e| unavailable(&path, e)),
                None => match fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(unavailable(&path, e)),
                },
            }
        }
        .boxed()
    }

    fn notifier(&self) -> broadcast::Sender<StorageChange> {
        self.notifier.clone()
    }
}
