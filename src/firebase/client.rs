use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::firebase::api_types::{
  records_from_run_query, structured_query, ApiDocument, ApiObjectMetadata, ApiRunQueryItem,
};
use crate::firebase::types::{OrderBy, Record};

const DEFAULT_STORAGE_URL: &str = "https://firebasestorage.googleapis.com";
const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com";

/// Resolves storage paths to download URLs.
pub trait UrlResolver: Send + Sync {
  /// `None` when nothing is stored at `path`.
  fn resolve(&self, path: &str) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// Reads documents from the database.
pub trait RecordReader: Send + Sync {
  /// Every document of `collection`, sorted by `order`.
  fn list_records(
    &self,
    collection: &str,
    order: &OrderBy,
  ) -> impl Future<Output = Result<Vec<Record>>> + Send;

  /// One document, `None` if it does not exist.
  fn get_record(
    &self,
    collection: &str,
    id: &str,
  ) -> impl Future<Output = Result<Option<Record>>> + Send;
}

/// REST client for the storage bucket and document database
#[derive(Clone)]
pub struct FirebaseClient {
  http: reqwest::Client,
  project_id: String,
  bucket: String,
  api_key: Option<String>,
  storage_url: Url,
  firestore_url: Url,
}

impl FirebaseClient {
  pub fn new(config: &Config) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(config.cache.request_timeout())
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let firebase = &config.firebase;
    let storage_url = parse_base(firebase.storage_url.as_deref().unwrap_or(DEFAULT_STORAGE_URL))?;
    let firestore_url =
      parse_base(firebase.firestore_url.as_deref().unwrap_or(DEFAULT_FIRESTORE_URL))?;

    Ok(Self {
      http,
      project_id: firebase.project_id.clone(),
      bucket: firebase.storage_bucket.clone(),
      api_key: config.api_key(),
      storage_url,
      firestore_url,
    })
  }

  fn with_key(&self, mut url: Url) -> Url {
    if let Some(key) = &self.api_key {
      url.query_pairs_mut().append_pair("key", key);
    }
    url
  }
}

impl UrlResolver for FirebaseClient {
  async fn resolve(&self, path: &str) -> Result<Option<String>> {
    let url = object_url(&self.storage_url, &self.bucket, path)?;

    let response = self
      .http
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch metadata for {}: {}", path, e))?;

    if response.status() == StatusCode::NOT_FOUND {
      debug!(path, "no object at path");
      return Ok(None);
    }

    let metadata: ApiObjectMetadata = response
      .error_for_status()
      .map_err(|e| eyre!("Failed to fetch metadata for {}: {}", path, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse metadata for {}: {}", path, e))?;

    match metadata.first_token() {
      Some(token) => Ok(Some(download_url(url, token).to_string())),
      None => {
        debug!(object = %metadata.name, "object has no download token");
        Ok(None)
      }
    }
  }
}

impl RecordReader for FirebaseClient {
  async fn list_records(&self, collection: &str, order: &OrderBy) -> Result<Vec<Record>> {
    let url = self.with_key(documents_url(
      &self.firestore_url,
      &self.project_id,
      &["documents:runQuery"],
    )?);

    let items: Vec<ApiRunQueryItem> = self
      .http
      .post(url)
      .json(&structured_query(collection, order))
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to list {}: {}", collection, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} listing: {}", collection, e))?;

    let records = records_from_run_query(items);
    debug!(collection, count = records.len(), "listed records");
    Ok(records)
  }

  async fn get_record(&self, collection: &str, id: &str) -> Result<Option<Record>> {
    let url = self.with_key(documents_url(
      &self.firestore_url,
      &self.project_id,
      &["documents", collection, id],
    )?);

    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to get {}/{}: {}", collection, id, e))?;

    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }

    let document: ApiDocument = response
      .error_for_status()
      .map_err(|e| eyre!("Failed to get {}/{}: {}", collection, id, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {}/{}: {}", collection, id, e))?;

    Ok(Some(document.into_record()))
  }
}

fn parse_base(raw: &str) -> Result<Url> {
  let url = Url::parse(raw).map_err(|e| eyre!("Invalid endpoint URL {}: {}", raw, e))?;
  if url.cannot_be_a_base() {
    return Err(eyre!("Endpoint URL cannot be a base: {}", raw));
  }
  Ok(url)
}

/// `{base}/v0/b/{bucket}/o/{path}` with the whole object path as one segment.
fn object_url(base: &Url, bucket: &str, path: &str) -> Result<Url> {
  let mut url = base.clone();
  url
    .path_segments_mut()
    .map_err(|_| eyre!("Storage URL cannot be a base: {}", base))?
    .pop_if_empty()
    .extend(["v0", "b", bucket, "o", path]);
  Ok(url)
}

fn download_url(mut object_url: Url, token: &str) -> Url {
  object_url
    .query_pairs_mut()
    .append_pair("alt", "media")
    .append_pair("token", token);
  object_url
}

/// `{base}/v1/projects/{project}/databases/(default)/{rest...}`
fn documents_url(base: &Url, project_id: &str, rest: &[&str]) -> Result<Url> {
  let mut url = base.clone();
  url
    .path_segments_mut()
    .map_err(|_| eyre!("Database URL cannot be a base: {}", base))?
    .pop_if_empty()
    .extend(["v1", "projects", project_id, "databases", "(default)"])
    .extend(rest);
  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_object_url_encodes_path_as_one_segment() {
    let base = parse_base(DEFAULT_STORAGE_URL).unwrap();
    let url = object_url(&base, "site.appspot.com", "images/gallery/blender/render 1.png").unwrap();

    assert_eq!(
      url.as_str(),
      "https://firebasestorage.googleapis.com/v0/b/site.appspot.com/o/images%2Fgallery%2Fblender%2Frender%201.png"
    );
    assert_eq!(
      download_url(url, "tok").as_str(),
      "https://firebasestorage.googleapis.com/v0/b/site.appspot.com/o/images%2Fgallery%2Fblender%2Frender%201.png?alt=media&token=tok"
    );
  }

  #[test]
  fn test_object_url_keeps_base_prefix() {
    let base = parse_base("http://localhost:9199/emulator/").unwrap();
    let url = object_url(&base, "b", "a.png").unwrap();
    assert_eq!(url.as_str(), "http://localhost:9199/emulator/v0/b/b/o/a.png");
  }

  #[test]
  fn test_documents_urls() {
    let base = parse_base(DEFAULT_FIRESTORE_URL).unwrap();

    let query = documents_url(&base, "site", &["documents:runQuery"]).unwrap();
    assert_eq!(
      query.as_str(),
      "https://firestore.googleapis.com/v1/projects/site/databases/(default)/documents:runQuery"
    );

    let doc = documents_url(&base, "site", &["documents", "blogPosts", "first-post"]).unwrap();
    assert_eq!(
      doc.as_str(),
      "https://firestore.googleapis.com/v1/projects/site/databases/(default)/documents/blogPosts/first-post"
    );
  }

  #[test]
  fn test_invalid_base_is_rejected() {
    assert!(parse_base("not a url").is_err());
    assert!(parse_base("mailto:someone@example.com").is_err());
  }
}
