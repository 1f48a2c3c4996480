//! Serving news articles through the article cache.
//!
//! Articles are stored as rows, a post with its headers and body, and assembled into their
//! wire form on first request by the [`ArticleBackend`]. The message-id is the cache key.
//!
//! Requests are answered by copyers, the cache consumers of this module, which write the
//! RFC 3977 response: a status line followed by a dot-stuffed data block. A STAT request only
//! needs to know that the article resolves and never reads it.

pub mod codes;
mod copyer;
mod dotwriter;
mod generate;
mod message_id;
mod service;
mod store;

pub use copyer::{ArticleCopyer, Part, StatCopyer};
pub use dotwriter::DotWriter;
pub use generate::{ArticleBackend, ArticleInfo, write_article};
pub use message_id::{InvalidMessageId, MAX_MESSAGE_ID_LEN, MessageId};
pub use service::{ArticleError, ArticleService, GroupState, Request};
pub use store::{ArticleRef, ArticleStore, JsonStore, Post, PostId};
