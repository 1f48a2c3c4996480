use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::caching::{CacheEntry, CacheError};

/// Identifies the stored rows of one post.
pub type PostId = u64;

/// A post as it is stored, before it is assembled into an article.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: PostId,
    pub message_id: String,
    pub group: String,
    pub number: u64,
    /// Header fields in their original order.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// The body with LF line endings.
    #[serde(default)]
    pub body: String,
    /// Removed by moderation. Banned posts do not resolve.
    #[serde(default)]
    pub banned: bool,
}

/// Where an article was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleRef {
    pub post: PostId,
    pub message_id: String,
    /// The article number in the group the lookup was made for, or `0` if it is not in it.
    pub number: u64,
}

/// Read access to stored posts.
///
/// Lookups resolve to [`CacheError::NotFound`] when there is no matching post.
pub trait ArticleStore: Send + Sync + 'static {
    /// Finds a post by message-id, numbered within `current_group` if given.
    fn lookup_msgid(&self, msgid: &str, current_group: Option<&str>) -> CacheEntry<ArticleRef>;

    /// Finds the post with article `number` in `group`.
    fn lookup_number(&self, group: &str, number: u64) -> CacheEntry<ArticleRef>;

    fn group_exists(&self, group: &str) -> CacheEntry<bool>;

    /// Loads everything needed to assemble the article of `post`.
    fn load_post(&self, post: PostId) -> CacheEntry<Post>;
}

#[derive(Debug, Default, Deserialize)]
struct StoreData {
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    posts: Vec<Post>,
}

/// An [`ArticleStore`] backed by a JSON document.
///
/// The document has a list of `groups` and a list of `posts`, each post carrying the fields
/// of [`Post`], with headers as `[name, value]` pairs.
#[derive(Debug, Default)]
pub struct JsonStore {
    data: RwLock<StoreData>,
}

impl JsonStore {
    /// Loads the store from a JSON file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open article store {}", path.display()))?;
        let data = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse article store {}", path.display()))?;
        Ok(Self {
            data: RwLock::new(data),
        })
    }

    pub fn from_value(value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(Self {
            data: RwLock::new(serde_json::from_value(value)?),
        })
    }

    /// Marks the post with `msgid` as banned, returning whether there was one to ban.
    ///
    /// This only changes the store. The cached article has to be invalidated separately.
    pub fn ban(&self, msgid: &str) -> bool {
        let mut data = self.data.write();
        let mut found = false;
        for post in data.posts.iter_mut().filter(|p| p.message_id == msgid) {
            post.banned = true;
            found = true;
        }
        found
    }
}

impl ArticleStore for JsonStore {
    fn lookup_msgid(&self, msgid: &str, current_group: Option<&str>) -> CacheEntry<ArticleRef> {
        let data = self.data.read();
        let post = data
            .posts
            .iter()
            .find(|p| !p.banned && p.message_id == msgid)
            .ok_or(CacheError::NotFound)?;

        let number = match current_group {
            Some(group) if group == post.group => post.number,
            _ => 0,
        };
        Ok(ArticleRef {
            post: post.id,
            message_id: post.message_id.clone(),
            number,
        })
    }

    fn lookup_number(&self, group: &str, number: u64) -> CacheEntry<ArticleRef> {
        let data = self.data.read();
        let post = data
            .posts
            .iter()
            .find(|p| !p.banned && p.group == group && p.number == number)
            .ok_or(CacheError::NotFound)?;

        Ok(ArticleRef {
            post: post.id,
            message_id: post.message_id.clone(),
            number,
        })
    }

    fn group_exists(&self, group: &str) -> CacheEntry<bool> {
        Ok(self.data.read().groups.iter().any(|g| g == group))
    }

    fn load_post(&self, post: PostId) -> CacheEntry<Post> {
        self.data
            .read()
            .posts
            .iter()
            .find(|p| !p.banned && p.id == post)
            .cloned()
            .ok_or(CacheError::NotFound)
    }
}
