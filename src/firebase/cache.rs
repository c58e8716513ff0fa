//! Caching implementations for portfolio content types.

use crate::cache::Cacheable;

use super::types::DownloadUrl;

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for DownloadUrl {
  fn kind() -> &'static str {
    "url"
  }
}

// ============================================================================
// Resource keys
// ============================================================================

const IMAGE_PREFIX: &str = "firebase_image_";
const BLOG_POSTS: &str = "firebase_blog_posts";
const GALLERY_SECTIONS: &str = "firebase_gallery_sections";

/// Cache keys for cached backend reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceKey {
  /// Download URL of one stored image
  Image { path: String },
  /// All blog posts, newest first
  BlogPosts,
  /// All gallery sections in display order
  GallerySections,
}

impl ResourceKey {
  /// Storage slot name.
  pub fn cache_key(&self) -> String {
    match self {
      Self::Image { path } => format!("{}{}", IMAGE_PREFIX, path),
      Self::BlogPosts => BLOG_POSTS.to_string(),
      Self::GallerySections => GALLERY_SECTIONS.to_string(),
    }
  }

  /// Recognize a slot name written by [`ResourceKey::cache_key`].
  pub fn parse(key: &str) -> Option<Self> {
    match key {
      BLOG_POSTS => Some(Self::BlogPosts),
      GALLERY_SECTIONS => Some(Self::GallerySections),
      _ => key.strip_prefix(IMAGE_PREFIX).map(|path| Self::Image {
        path: path.to_string(),
      }),
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Image { path } => format!("image {}", path),
      Self::BlogPosts => "blog posts".to_string(),
      Self::GallerySections => "gallery sections".to_string(),
    }
  }
}
