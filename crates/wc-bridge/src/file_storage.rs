use crate::{Error, Result, StorageAdapter};
use std::fs;
use std::path::PathBuf;

/// One JSON file per key under `base_path`.
///
/// Keys are percent-encoded into file names so `list` can recover them exactly.
/// Writes go through a temporary file and a rename, so a crash never leaves a
/// half-written record behind.
pub struct FileStorageAdapter {
    base_path: PathBuf,
}

impl FileStorageAdapter {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        Ok(Self { base_path })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", urlencoding::encode(key)))
    }
}

impl StorageAdapter for FileStorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_to_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read file: {}", e))),
        }
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_to_path(key);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, value)
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::Storage(format!("Failed to replace file: {}", e)))?;

        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete file: {}", e))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.base_path)
            .map_err(|e| Error::Storage(format!("Failed to read directory: {}", e)))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Storage(format!("Failed to read dir entry: {}", e)))?;

            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(encoded) = file_name.strip_suffix(".json") else {
                continue;
            };
            let Ok(key) = urlencoding::decode(encoded) else {
                continue;
            };

            if key.starts_with(prefix) {
                keys.push(key.into_owned());
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_del() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorageAdapter::new(temp.path().to_path_buf()).unwrap();

        assert_eq!(storage.get("wc-session/a").unwrap(), None);
        storage.put("wc-session/a", "{\"x\":1}".to_string()).unwrap();
        assert_eq!(
            storage.get("wc-session/a").unwrap().as_deref(),
            Some("{\"x\":1}")
        );

        storage.put("wc-session/a", "{\"x\":2}".to_string()).unwrap();
        assert_eq!(
            storage.get("wc-session/a").unwrap().as_deref(),
            Some("{\"x\":2}")
        );

        storage.del("wc-session/a").unwrap();
        assert_eq!(storage.get("wc-session/a").unwrap(), None);
        storage.del("wc-session/a").unwrap();
    }

    #[test]
    fn test_list_recovers_original_keys_by_prefix() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorageAdapter::new(temp.path().to_path_buf()).unwrap();

        storage.put("wc-session/b", "1".to_string()).unwrap();
        storage.put("wc-session/a:b", "2".to_string()).unwrap();
        storage.put("wc-context/a", "3".to_string()).unwrap();

        assert_eq!(
            storage.list("wc-session/").unwrap(),
            vec!["wc-session/a:b".to_string(), "wc-session/b".to_string()]
        );
        assert_eq!(storage.list("").unwrap().len(), 3);
    }

    #[test]
    fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let storage = FileStorageAdapter::new(temp.path().to_path_buf()).unwrap();
            storage.put("k", "v".to_string()).unwrap();
        }
        let storage = FileStorageAdapter::new(temp.path().to_path_buf()).unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v"));
    }
}
