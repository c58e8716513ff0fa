//! Content client that wraps the backend with transparent caching.

use chrono::Duration;
use color_eyre::{eyre::Report, Result};
use futures::future::try_join_all;
use tracing::debug;

use crate::cache::{CacheLayer, Clock, EntryInfo, KeyValueStore, Refresh, SystemClock};
use crate::config::CacheConfig;

use super::cache::ResourceKey;
use super::client::{RecordReader, UrlResolver};
use super::types::{DownloadUrl, OrderBy, Record};

pub const BLOG_COLLECTION: &str = "blogPosts";
pub const GALLERY_COLLECTION: &str = "gallerySections";

/// How long each resource kind stays fresh.
#[derive(Debug, Clone, Copy)]
pub struct Ttls {
  pub image: Duration,
  pub list: Duration,
}

impl Default for Ttls {
  fn default() -> Self {
    Self {
      image: Duration::hours(24),
      list: Duration::hours(1),
    }
  }
}

impl TryFrom<&CacheConfig> for Ttls {
  type Error = Report;

  fn try_from(config: &CacheConfig) -> Result<Self> {
    Ok(Self {
      image: config.image_ttl()?,
      list: config.list_ttl()?,
    })
  }
}

/// Portfolio content reads with caching.
///
/// Image URLs, blog posts and gallery sections go through the cache; single
/// documents are always read from the backend.
pub struct CachedContentClient<B, S: KeyValueStore, C: Clock = SystemClock> {
  backend: B,
  cache: CacheLayer<S, C>,
  ttls: Ttls,
}

impl<B, S, C> CachedContentClient<B, S, C>
where
  B: UrlResolver + RecordReader,
  S: KeyValueStore,
  C: Clock,
{
  pub fn new(backend: B, cache: CacheLayer<S, C>, ttls: Ttls) -> Self {
    Self {
      backend,
      cache,
      ttls,
    }
  }

  /// Download URL of the image at `path`, `None` if there is no such image.
  pub async fn image_url(&self, path: &str, refresh: Refresh) -> Result<Option<String>> {
    let key = ResourceKey::Image {
      path: path.to_string(),
    };
    let backend = &self.backend;

    let result = self
      .cache
      .fetch(&key.cache_key(), self.ttls.image, refresh, move || async move {
        let url = backend.resolve(path).await?;
        Ok::<_, Report>(url.map(DownloadUrl))
      })
      .await?;
    debug!(path, source = ?result.source, fetched_at = result.fetched_at, "image url");

    Ok(result.data.map(|url| url.0))
  }

  /// Resolve several images concurrently, preserving input order.
  ///
  /// Batch lookups never force a refresh.
  pub async fn image_urls(&self, paths: &[String]) -> Result<Vec<(String, Option<String>)>> {
    let backend = &self.backend;

    let lookups = paths.iter().map(|path| async move {
      let key = ResourceKey::Image { path: path.clone() };
      let result = self
        .cache
        .get(&key.cache_key(), self.ttls.image, move || async move {
          let url = backend.resolve(path).await?;
          Ok::<_, Report>(url.map(DownloadUrl))
        })
        .await?;

      Ok::<_, Report>((path.clone(), result.data.map(|url| url.0)))
    });

    try_join_all(lookups).await
  }

  /// All blog posts, newest first.
  pub async fn blog_posts(&self, refresh: Refresh) -> Result<Vec<Record>> {
    self
      .cached_list(
        ResourceKey::BlogPosts,
        BLOG_COLLECTION,
        OrderBy::desc("date"),
        refresh,
      )
      .await
  }

  /// A single blog post, read straight from the backend.
  pub async fn blog_post(&self, id: &str) -> Result<Option<Record>> {
    self.backend.get_record(BLOG_COLLECTION, id).await
  }

  /// All gallery sections in display order.
  pub async fn gallery_sections(&self, refresh: Refresh) -> Result<Vec<Record>> {
    self
      .cached_list(
        ResourceKey::GallerySections,
        GALLERY_COLLECTION,
        OrderBy::asc("order"),
        refresh,
      )
      .await
  }

  /// Image file names listed on one gallery section; empty if it doesn't exist.
  pub async fn section_images(&self, section_id: &str) -> Result<Vec<String>> {
    let section = self
      .backend
      .get_record(GALLERY_COLLECTION, section_id)
      .await?;

    Ok(
      section
        .map(|s| s.images().into_iter().map(String::from).collect())
        .unwrap_or_default(),
    )
  }

  /// Stored entries with freshness judged by each key's own TTL.
  pub fn cache_entries(&self) -> Result<Vec<EntryInfo>> {
    let ttls = self.ttls;
    self.cache.entries(move |key| match ResourceKey::parse(key) {
      Some(ResourceKey::Image { .. }) => ttls.image,
      Some(_) => ttls.list,
      None => Duration::zero(),
    })
  }

  async fn cached_list(
    &self,
    key: ResourceKey,
    collection: &str,
    order: OrderBy,
    refresh: Refresh,
  ) -> Result<Vec<Record>> {
    let backend = &self.backend;

    let result = self
      .cache
      .fetch(&key.cache_key(), self.ttls.list, refresh, move || async move {
        backend.list_records(collection, &order).await
      })
      .await?;
    debug!(
      resource = %key.description(),
      source = ?result.source,
      fetched_at = result.fetched_at,
      count = result.data.len(),
      "listing"
    );

    Ok(result.data)
  }
}
