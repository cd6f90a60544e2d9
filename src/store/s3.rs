//! S3-compatible `ObjectStore`, backed by the `rust-s3` crate. Credentials
//! and endpoint come from the `[S3]` config section (§6 `s3:https://host/bucket`).

use s3::bucket::Bucket;
use s3::creds::Credentials;

use crate::config::S3Settings;
use crate::error::{Error, Result};
use crate::store::ObjectStore;

pub struct S3Store {
    bucket: Bucket,
    url: String,
}

impl S3Store {
    pub fn new(settings: &S3Settings) -> Result<Self> {
        let credentials = Credentials::new(
            Some(&settings.access_key),
            Some(&settings.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| Error::Config(format!("invalid S3 credentials: {e}")))?;

        let region = s3::region::Region::Custom {
            region: settings.region.clone().unwrap_or_default(),
            endpoint: settings.endpoint.clone(),
        };

        let bucket = Bucket::new(&settings.bucket, region, credentials)
            .map_err(|e| Error::Config(format!("invalid S3 bucket configuration: {e}")))?
            .with_path_style();

        let url = format!("s3:{}/{}", settings.endpoint, settings.bucket);
        Ok(S3Store { bucket, url })
    }
}

impl ObjectStore for S3Store {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.bucket
            .put_object(path, bytes)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let response = self
            .bucket
            .get_object(path)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

        if response.status_code() == 404 {
            return Err(Error::not_found(path));
        }
        Ok(response.into_bytes().to_vec())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let response = self
            .bucket
            .head_object(path)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        Ok(response.1 == 200)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let results = self
            .bucket
            .list(prefix.to_string(), None)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

        Ok(results
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|obj| obj.key))
            .collect())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.bucket
            .delete_object(path)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}
