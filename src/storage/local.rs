use super::{BlobStore, StorageError};
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::{io::ErrorKind, path::PathBuf};
use tokio::fs;

/// Characters kept verbatim when a key becomes a filename.
const FILENAME_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Characters escaped again when a filename becomes a URL path segment.
const URL_SEGMENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Directory under the root holding in-flight writes.
const PARTIAL_DIR: &str = ".partial";

/// A bucket backed by a flat directory.
///
/// Each key is percent-encoded into one filename so that any key, including
/// ones containing `/`, stays inside the root directory.
///
/// Only the bytes are kept. The content type passed to `put` is not stored,
/// so whatever serves the directory derives it from the filename extension.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBucket {
    /// Creates a new `LocalBucket` rooted at `root`.
    ///
    /// # Arguments
    /// * `root` - Directory holding the objects. Created on first write.
    /// * `public_base_url` - URL prefix the directory is served under.
    pub fn new(root: PathBuf, public_base_url: impl Into<String>) -> Self {
        LocalBucket {
            root,
            public_base_url: public_base_url.into(),
        }
    }

    /// Directory the objects live in.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Absolute path of the file holding `key`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(encode_key(key)?))
    }
}

impl BlobStore for LocalBucket {
    async fn put(
        &self,
        key: &str,
        content: Bytes,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let target = self.path_for(key)?;
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };

        let partial_dir = self.root.join(PARTIAL_DIR);
        fs::create_dir_all(&partial_dir).await.map_err(io_err)?;

        // Write aside and rename so readers never observe a half-written object.
        let partial = partial_dir.join(uuid::Uuid::new_v4().to_string());
        if let Err(e) = fs::write(&partial, &content).await {
            let _ = fs::remove_file(&partial).await;
            return Err(io_err(e));
        }
        if let Err(e) = fs::rename(&partial, &target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(io_err(e));
        }

        Ok(self.public_url(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let target = self.path_for(key)?;

        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(StorageError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let io_err = |source| StorageError::Io {
            key: self.root.to_string_lossy().to_string(),
            source,
        };

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(e)),
        };

        let mut keys = vec![];
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if !entry.file_type().await.map_err(io_err)?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Ok(key) = percent_decode_str(name).decode_utf8() {
                keys.push(key.into_owned());
            }
        }
        keys.sort();

        Ok(keys)
    }

    fn public_url(&self, key: &str) -> String {
        let filename = utf8_percent_encode(key, FILENAME_SET).to_string();
        format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            utf8_percent_encode(&filename, URL_SEGMENT_SET)
        )
    }
}

/// Turns a key into the filename it is stored under.
fn encode_key(key: &str) -> Result<String, StorageError> {
    let encoded = utf8_percent_encode(key, FILENAME_SET).to_string();

    if encoded.is_empty() || encoded == "." || encoded == ".." || encoded == PARTIAL_DIR {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }

    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::{LocalBucket, encode_key};
    use crate::storage::{BlobStore, StorageError};
    use bytes::Bytes;
    use std::fs;
    use tempfile::TempDir;

    fn get_bucket(tmp_dir: &TempDir) -> LocalBucket {
        LocalBucket::new(tmp_dir.path().to_path_buf(), "http://localhost:5000/blobs/")
    }

    #[test]
    fn test_encode_key() {
        assert_eq!("cat.png", encode_key("cat.png").unwrap());
        assert_eq!("a%2Fb%20c.png", encode_key("a/b c.png").unwrap());
        assert!(matches!(
            encode_key(".."),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(matches!(encode_key(""), Err(StorageError::InvalidKey { .. })));
    }

    #[test]
    fn test_public_url() {
        let tmp_dir = TempDir::new().unwrap();
        let bucket = get_bucket(&tmp_dir);

        assert_eq!(
            "http://localhost:5000/blobs/cat.png",
            bucket.public_url("cat.png")
        );
        // The served directory holds the encoded name, so the URL escapes it once more.
        assert_eq!(
            "http://localhost:5000/blobs/my%2520cat.png",
            bucket.public_url("my cat.png")
        );
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let tmp_dir = TempDir::new().unwrap();
        let bucket = get_bucket(&tmp_dir);

        let url = bucket
            .put("cat.png", Bytes::from_static(b"first"), "image/png")
            .await
            .unwrap();
        bucket
            .put("cat.png", Bytes::from_static(b"second"), "image/png")
            .await
            .unwrap();

        assert_eq!(bucket.public_url("cat.png"), url);
        assert_eq!(
            b"second".to_vec(),
            fs::read(bucket.path_for("cat.png").unwrap()).unwrap()
        );
        assert_eq!(vec!["cat.png".to_string()], bucket.list_keys().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let tmp_dir = TempDir::new().unwrap();
        let bucket = get_bucket(&tmp_dir);

        bucket
            .put("dir/dog.jpg", Bytes::from_static(b"woof"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(
            vec!["dir/dog.jpg".to_string()],
            bucket.list_keys().await.unwrap()
        );

        assert!(bucket.delete("dir/dog.jpg").await.is_ok());

        let result = bucket.delete("dir/dog.jpg").await;
        let Err(StorageError::NotFound { key }) = result else {
            panic!("Expected NotFound error, but got {:?}", result);
        };
        assert_eq!("dir/dog.jpg", key);
        assert!(bucket.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rename_cleans_partial() {
        let tmp_dir = TempDir::new().unwrap();
        let bucket = get_bucket(&tmp_dir);
        // A non-empty directory where the object should go makes the rename fail.
        let blocker = bucket.path_for("cat.png").unwrap();
        fs::create_dir_all(blocker.join("inner")).unwrap();

        let result = bucket
            .put("cat.png", Bytes::from_static(b"meow"), "image/png")
            .await;

        assert!(matches!(result, Err(StorageError::Io { .. })));
        let leftovers = fs::read_dir(tmp_dir.path().join(".partial")).unwrap().count();
        assert_eq!(0, leftovers);
    }

    #[tokio::test]
    async fn test_list_keys_on_missing_root() {
        let tmp_dir = TempDir::new().unwrap();
        let bucket = LocalBucket::new(tmp_dir.path().join("absent"), "http://localhost");

        assert!(bucket.list_keys().await.unwrap().is_empty());
    }
}
