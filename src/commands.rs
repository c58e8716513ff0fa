use chrono::{DateTime, Duration};
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tracing::info;

use crate::cache::{Clock, EntryInfo, KeyValueStore, Refresh};
use crate::firebase::cache::ResourceKey;
use crate::firebase::cached_client::CachedContentClient;
use crate::firebase::client::{RecordReader, UrlResolver};
use crate::firebase::types::Record;
use crate::gallery;

/// Shown when an image path has nothing behind it
const NO_IMAGE: &str = "(no image)";

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Print the storage path of a gallery image
  GalleryPath { section: String, filename: String },
  #[command(flatten)]
  Content(ContentCommand),
}

/// Commands that read from the backend.
#[derive(Subcommand, Debug)]
pub enum ContentCommand {
  /// Resolve the download URL of one stored image
  Image {
    /// Storage path, e.g. images/projects/robot.png
    path: String,
    /// Skip the cache and ask the backend
    #[arg(long)]
    refresh: bool,
    /// Printed when the image is missing or cannot be resolved
    #[arg(long)]
    fallback: Option<String>,
  },
  /// Resolve several images at once
  Images {
    #[arg(required = true)]
    paths: Vec<String>,
  },
  /// List blog posts, newest first
  Posts {
    #[arg(long)]
    refresh: bool,
  },
  /// Show one blog post
  Post { id: String },
  /// List gallery sections
  Gallery {
    #[arg(long)]
    refresh: bool,
  },
  /// List the image files of one gallery section
  SectionImages { id: String },
  /// Show what the cache currently holds
  Cache,
}

/// Execute `command`, writing its output to stdout.
pub async fn run<B, S, C>(
  command: ContentCommand,
  client: &CachedContentClient<B, S, C>,
  json: bool,
) -> Result<()>
where
  B: UrlResolver + RecordReader,
  S: KeyValueStore,
  C: Clock,
{
  match command {
    ContentCommand::Image {
      path,
      refresh,
      fallback,
    } => {
      let lookup = client.image_url(&path, Refresh::from(refresh)).await;
      if json {
        let url = lookup?;
        print_json(&serde_json::json!({ "path": path, "url": url }))?;
      } else {
        if let Some(line) = image_line(&lookup, fallback.as_deref()) {
          println!("{}", line);
        }
        lookup?;
      }
    }
    ContentCommand::Images { paths } => {
      let urls = client.image_urls(&paths).await?;
      if json {
        let map: serde_json::Map<String, serde_json::Value> = urls
          .into_iter()
          .map(|(path, url)| (path, url.map_or(serde_json::Value::Null, Into::into)))
          .collect();
        print_json(&map)?;
      } else {
        for (path, url) in urls {
          println!("{}  {}", path, url.as_deref().unwrap_or(NO_IMAGE));
        }
      }
    }
    ContentCommand::Posts { refresh } => {
      let posts = client.blog_posts(Refresh::from(refresh)).await?;
      info!(count = posts.len(), "loaded blog posts");
      if json {
        print_json(&posts)?;
      } else {
        posts.iter().for_each(|p| println!("{}", post_line(p)));
      }
    }
    ContentCommand::Post { id } => {
      let post = client
        .blog_post(&id)
        .await?
        .ok_or_else(|| eyre!("Blog post not found: {}", id))?;
      if json {
        print_json(&post)?;
      } else {
        print!("{}", post_body(&post));
      }
    }
    ContentCommand::Gallery { refresh } => {
      let sections = client.gallery_sections(Refresh::from(refresh)).await?;
      if json {
        print_json(&sections)?;
      } else {
        sections.iter().for_each(|s| println!("{}", section_line(s)));
      }
    }
    ContentCommand::SectionImages { id } => {
      let images = client.section_images(&id).await?;
      if json {
        let paths: Vec<String> = images.iter().map(|f| gallery::image_path(&id, f)).collect();
        print_json(&paths)?;
      } else {
        for filename in images {
          println!("{}", gallery::image_path(&id, &filename));
        }
      }
    }
    ContentCommand::Cache => {
      let entries = client.cache_entries()?;
      if json {
        let rows: Vec<EntryRow> = entries.iter().map(EntryRow::from).collect();
        print_json(&rows)?;
      } else if entries.is_empty() {
        println!("cache is empty");
      } else {
        entries.iter().for_each(|e| println!("{}", entry_line(e)));
      }
    }
  }

  Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let out =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", out);
  Ok(())
}

/// Text for an image lookup. The fallback covers both a missing image and a
/// failed lookup; without one, a failure prints nothing.
fn image_line(lookup: &Result<Option<String>>, fallback: Option<&str>) -> Option<String> {
  match (lookup, fallback) {
    (Ok(Some(url)), _) => Some(url.clone()),
    (_, Some(fallback)) => Some(fallback.to_string()),
    (Ok(None), None) => Some(NO_IMAGE.to_string()),
    (Err(_), None) => None,
  }
}

/// `YYYY-MM-DD` for RFC 3339 timestamps, the raw value otherwise.
fn short_date(date: &str) -> String {
  DateTime::parse_from_rfc3339(date)
    .map(|d| d.format("%Y-%m-%d").to_string())
    .unwrap_or_else(|_| date.to_string())
}

fn post_line(post: &Record) -> String {
  let date = post.date().map(short_date).unwrap_or_default();
  let mut line = format!("{:<10}  {:<24}  {}", date, post.id, post.title().unwrap_or("-"));
  if let Some(category) = post.category() {
    line.push_str(&format!(" [{}]", category));
  }
  line
}

fn post_body(post: &Record) -> String {
  let mut out = format!("{}\n", post.title().unwrap_or(&post.id));
  let meta: Vec<String> = [post.date().map(short_date), post.category().map(String::from)]
    .into_iter()
    .flatten()
    .collect();
  if !meta.is_empty() {
    out.push_str(&format!("{}\n", meta.join(" · ")));
  }
  if let Some(content) = post.content().or(post.excerpt()) {
    out.push('\n');
    out.push_str(content);
    out.push('\n');
  }
  out
}

fn section_line(section: &Record) -> String {
  let order = section
    .order()
    .map(|o| format!("{}", o))
    .unwrap_or_else(|| "-".to_string());
  format!(
    "{:>3}  {:<16}  {} ({} images)",
    order,
    section.id,
    section.title().unwrap_or("-"),
    section.images().len()
  )
}

/// Compact age such as `45s`, `12m`, `3h05m` or `2d04h`.
fn format_age(age: Duration) -> String {
  let secs = age.num_seconds().max(0);
  match secs {
    s if s < 60 => format!("{}s", s),
    s if s < 3600 => format!("{}m", s / 60),
    s if s < 86_400 => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    s => format!("{}d{:02}h", s / 86_400, (s % 86_400) / 3600),
  }
}

fn entry_line(entry: &EntryInfo) -> String {
  let state = match (&entry.kind, entry.fresh) {
    (None, _) => "corrupt",
    (Some(_), true) => "fresh",
    (Some(_), false) => "stale",
  };
  let label = ResourceKey::parse(&entry.key)
    .map(|k| k.description())
    .unwrap_or_else(|| entry.key.clone());

  format!(
    "{:<7}  {:<4}  {:>6}  {}",
    state,
    entry.kind.as_deref().unwrap_or("?"),
    entry.age.map(format_age).unwrap_or_else(|| "-".to_string()),
    label
  )
}

#[derive(Serialize)]
struct EntryRow<'a> {
  key: &'a str,
  kind: Option<&'a str>,
  age_secs: Option<i64>,
  fresh: bool,
}

impl<'a> From<&'a EntryInfo> for EntryRow<'a> {
  fn from(entry: &'a EntryInfo) -> Self {
    Self {
      key: &entry.key,
      kind: entry.kind.as_deref(),
      age_secs: entry.age.map(|a| a.num_seconds()),
      fresh: entry.fresh,
    }
  }
}
