use std::io::{self, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::caching::{Cache, CacheDirectory, CacheEntry, CacheError, ObtainError};
use crate::config::{CachesConfig, Config};

use super::codes;
use super::copyer::{ArticleCopyer, Part, StatCopyer};
use super::generate::{ArticleBackend, ArticleInfo};
use super::message_id::MessageId;
use super::store::{ArticleRef, ArticleStore};

/// The article retrieval commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Article,
    Head,
    Body,
    Stat,
}

impl Request {
    fn part(self) -> Option<Part> {
        match self {
            Request::Article => Some(Part::Article),
            Request::Head => Some(Part::Head),
            Request::Body => Some(Part::Body),
            Request::Stat => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Request::Article => "article",
            Request::Head => "head",
            Request::Body => "body",
            Request::Stat => "stat",
        }
    }
}

/// The group cursor of one client session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupState {
    group: Option<String>,
    current: Option<u64>,
}

impl GroupState {
    /// The selected group.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// The current article number in the selected group.
    pub fn current(&self) -> Option<u64> {
        self.current
    }
}

/// Why an article request could not be answered.
#[derive(Debug, Error)]
pub enum ArticleError {
    #[error("no such article")]
    NoSuchMessageId,
    #[error("no such newsgroup")]
    NoSuchGroup,
    #[error("no newsgroup selected")]
    NoGroupSelected,
    #[error("current article number is invalid")]
    NoCurrentArticle,
    #[error("no article with that number")]
    NoSuchNumber,
    #[error("internal fault: {0}")]
    Internal(#[from] CacheError),
    /// The response was already started when this happened. The connection has to be reset.
    #[error("response aborted")]
    Aborted(#[source] io::Error),
    /// Writing to the client failed before anything was sent.
    #[error("failed to write response")]
    Io(#[source] io::Error),
}

impl ArticleError {
    /// The NNTP status code to answer with, if an answer is still possible.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::NoSuchMessageId => Some(codes::NO_SUCH_MESSAGE_ID),
            Self::NoSuchGroup => Some(codes::NO_SUCH_GROUP),
            Self::NoGroupSelected => Some(codes::NO_GROUP_SELECTED),
            Self::NoCurrentArticle => Some(codes::NO_CURRENT_ARTICLE),
            Self::NoSuchNumber => Some(codes::NO_SUCH_NUMBER),
            Self::Internal(_) => Some(codes::INTERNAL_FAULT),
            Self::Aborted(_) | Self::Io(_) => None,
        }
    }

    /// Writes the status line for this error.
    ///
    /// Returns `false` without writing anything if the connection has to be reset instead.
    pub fn write_response<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<bool> {
        let Some(code) = self.code() else {
            return Ok(false);
        };
        write!(out, "{code} {self}\r\n")?;
        out.flush()?;
        Ok(true)
    }
}

/// Answers article requests from the article cache.
///
/// The [`ArticleStore`] resolves what the client asks for. The article itself is always
/// delivered through the cache, which assembles it from the store on first use.
pub struct ArticleService<S: ArticleStore> {
    store: Arc<S>,
    articles: CacheDirectory<ArticleBackend<S>>,
}

impl<S: ArticleStore> ArticleService<S> {
    pub fn new(store: Arc<S>, cache: Cache, config: CachesConfig) -> Self {
        let backend = ArticleBackend::new(cache, Arc::clone(&store));
        Self {
            store,
            articles: CacheDirectory::new("articles", backend, config),
        }
    }

    /// Creates the service with the article cache below the configured cache directory.
    pub fn from_config(config: &Config, store: Arc<S>) -> io::Result<Self> {
        let cache = Cache::from_config("articles", config)?;
        Ok(Self::new(store, cache, config.caches))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn articles(&self) -> &CacheDirectory<ArticleBackend<S>> {
        &self.articles
    }

    /// Makes `group` the selected group of the session.
    pub fn select_group(&self, state: &mut GroupState, group: &str) -> Result<(), ArticleError> {
        if !self.store.group_exists(group)? {
            return Err(ArticleError::NoSuchGroup);
        }
        state.group = Some(group.to_owned());
        state.current = None;
        Ok(())
    }

    /// Answers a request for the article with `msgid`.
    ///
    /// The session cursor is left alone.
    pub fn obtain_by_msgid<W: Write>(
        &self,
        out: &mut W,
        request: Request,
        msgid: &str,
        state: &GroupState,
    ) -> Result<(), ArticleError> {
        let msgid = match MessageId::new(msgid) {
            Ok(msgid) => msgid,
            Err(err) => {
                tracing::debug!(msgid, error = %err, "Rejected message-id");
                return Err(ArticleError::NoSuchMessageId);
            }
        };

        let found = match self.store.lookup_msgid(msgid.as_str(), state.group()) {
            Ok(found) => found,
            Err(CacheError::NotFound) => return Err(ArticleError::NoSuchMessageId),
            Err(err) => return Err(err.into()),
        };
        self.deliver(out, request, &found, ArticleError::NoSuchMessageId)
    }

    /// Answers a request for article `number` in the selected group.
    ///
    /// Once the response is underway, `number` becomes the current article of the session.
    pub fn obtain_by_number<W: Write>(
        &self,
        out: &mut W,
        request: Request,
        number: u64,
        state: &mut GroupState,
    ) -> Result<(), ArticleError> {
        let group = state.group().ok_or(ArticleError::NoGroupSelected)?;

        let found = match self.store.lookup_number(group, number) {
            Ok(found) => found,
            Err(CacheError::NotFound) => return Err(ArticleError::NoSuchNumber),
            Err(err) => return Err(err.into()),
        };

        let result = self.deliver(out, request, &found, ArticleError::NoSuchNumber);
        if matches!(result, Ok(()) | Err(ArticleError::Aborted(_))) {
            state.current = Some(number);
        }
        result
    }

    /// Answers a request for the current article of the session.
    pub fn obtain_current<W: Write>(
        &self,
        out: &mut W,
        request: Request,
        state: &GroupState,
    ) -> Result<(), ArticleError> {
        let group = state.group().ok_or(ArticleError::NoGroupSelected)?;
        let number = state.current().ok_or(ArticleError::NoCurrentArticle)?;

        let found = match self.store.lookup_number(group, number) {
            Ok(found) => found,
            Err(CacheError::NotFound) => return Err(ArticleError::NoCurrentArticle),
            Err(err) => return Err(err.into()),
        };
        self.deliver(out, request, &found, ArticleError::NoCurrentArticle)
    }

    fn deliver<W: Write>(
        &self,
        out: &mut W,
        request: Request,
        found: &ArticleRef,
        not_found: ArticleError,
    ) -> Result<(), ArticleError> {
        metric!(counter("articles.requests") += 1, "request" => request.name());

        let info = ArticleInfo { post: found.post };
        let key = found.message_id.as_str();
        let (result, broken) = match request.part() {
            Some(part) => {
                let mut copyer = ArticleCopyer::new(&mut *out, part, found.number);
                let result = self.articles.obtain(&mut copyer, key, &info);
                (result, copyer.is_broken())
            }
            None => {
                let mut copyer = StatCopyer::new(&mut *out, found.number);
                let result = self.articles.obtain(&mut copyer, key, &info);
                (result, false)
            }
        };

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        tracing::debug!(msgid = key, error = &err as &dyn std::error::Error, "Article request failed");

        if broken {
            return Err(ArticleError::Aborted(io::Error::other(err)));
        }
        match err {
            ObtainError::Cache(CacheError::NotFound) => Err(not_found),
            ObtainError::Cache(err) => Err(ArticleError::Internal(err)),
            ObtainError::Consumer(err) => Err(ArticleError::Io(err)),
        }
    }

    /// Drops the cached article for `msgid`, so that it is assembled again on next use.
    pub fn invalidate(&self, msgid: &str) -> CacheEntry {
        self.invalidate_with(msgid, || Ok(()))
    }

    /// Runs `update` while the cached article for `msgid` is invalidated.
    ///
    /// Requests for the article wait until `update` is done, so that they can not cache the
    /// article as it was before. This is how deleting and moderating articles stays
    /// consistent with the cache.
    pub fn invalidate_with<T, F>(&self, msgid: &str, update: F) -> CacheEntry<T>
    where
        F: FnOnce() -> CacheEntry<T>,
    {
        let (invalidation, deleted) = self.articles.invalidate_start(msgid);
        let result = deleted.and_then(|()| update());
        self.articles.invalidate_finish(invalidation);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::test;

    use super::super::store::JsonStore;
    use super::*;

    fn service(root: &std::path::Path) -> ArticleService<JsonStore> {
        let store = JsonStore::from_value(test::article_store()).unwrap();
        let cache = Cache::new("articles", root).unwrap();
        ArticleService::new(Arc::new(store), cache, CachesConfig::default())
    }

    fn response(
        f: impl FnOnce(&mut Vec<u8>) -> Result<(), ArticleError>,
    ) -> Result<String, ArticleError> {
        let mut out = Vec::new();
        f(&mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_by_msgid() {
        test::setup();
        let root = test::tempdir();
        let service = service(root.path());
        let state = GroupState::default();

        let article = response(|out| {
            service.obtain_by_msgid(out, Request::Article, "<first@example.com>", &state)
        })
        .unwrap();
        assert_eq!(
            article,
            "220 0 <first@example.com> article\r\n\
             Message-ID: <first@example.com>\r\n\
             Newsgroups: misc.test\r\n\
             From: Alice <alice@example.com>\r\n\
             Subject: Hello\r\n\
             Date: Mon, 05 Oct 2026 12:00:00 +0000\r\n\
             \r\n\
             Hello world\r\n\
             .\r\n"
        );

        let body = response(|out| {
            service.obtain_by_msgid(out, Request::Body, "<second@example.com>", &state)
        })
        .unwrap();
        assert_eq!(
            body,
            "222 0 <second@example.com> body\r\n\
             line one\r\n..dotted line\r\n...\r\nlast line\r\n.\r\n"
        );

        // both came from the same cache
        assert!(service.articles().is_empty());
        let path = service
            .articles()
            .backend()
            .cache()
            .stable_path(&crate::caching::CacheKey::new("<second@example.com>"));
        assert!(path.exists());
    }

    #[test]
    fn test_by_msgid_errors() {
        test::setup();
        let root = test::tempdir();
        let service = service(root.path());
        let state = GroupState::default();

        for msgid in ["<nope@example.com>", "<banned@example.com>", "first@example.com"] {
            let mut out = Vec::new();
            let err = service
                .obtain_by_msgid(&mut out, Request::Article, msgid, &state)
                .unwrap_err();
            assert!(matches!(err, ArticleError::NoSuchMessageId), "{msgid}");
            assert!(out.is_empty());

            err.write_response(&mut out).unwrap();
            assert_eq!(out, b"430 no such article\r\n");
        }
    }

    #[test]
    fn test_group_cursor() {
        test::setup();
        let root = test::tempdir();
        let service = service(root.path());
        let mut state = GroupState::default();

        let mut out = Vec::new();
        let err = service
            .obtain_by_number(&mut out, Request::Article, 1, &mut state)
            .unwrap_err();
        assert_eq!(err.code(), Some(412));
        let err = service
            .obtain_current(&mut out, Request::Article, &state)
            .unwrap_err();
        assert_eq!(err.code(), Some(412));

        let err = service.select_group(&mut state, "alt.nope").unwrap_err();
        assert_eq!(err.code(), Some(411));
        service.select_group(&mut state, "misc.test").unwrap();

        let err = service
            .obtain_current(&mut out, Request::Article, &state)
            .unwrap_err();
        assert_eq!(err.code(), Some(420));

        let err = service
            .obtain_by_number(&mut out, Request::Article, 3, &mut state)
            .unwrap_err();
        assert_eq!(err.code(), Some(423));
        assert_eq!(state.current(), None);
        assert!(out.is_empty());

        let head = response(|out| service.obtain_by_number(out, Request::Head, 2, &mut state))
            .unwrap();
        assert_eq!(
            head,
            "221 2 <second@example.com> head\r\n\
             Message-ID: <second@example.com>\r\n\
             Newsgroups: misc.test\r\n\
             From: Bob <bob@example.com>\r\n\
             Subject: Re: Hello\r\n\
             References: <first@example.com>\r\n\
             .\r\n"
        );
        assert_eq!(state.current(), Some(2));

        // within the group, articles requested by message-id carry their number
        let stat = response(|out| {
            service.obtain_by_msgid(out, Request::Stat, "<first@example.com>", &state)
        })
        .unwrap();
        assert_eq!(stat, "223 1 <first@example.com>\r\n");
        assert_eq!(state.current(), Some(2));

        let stat = response(|out| service.obtain_current(out, Request::Stat, &state)).unwrap();
        assert_eq!(stat, "223 2 <second@example.com>\r\n");
    }

    #[test]
    fn test_moderation() {
        test::setup();
        let root = test::tempdir();
        let service = service(root.path());
        let state = GroupState::default();

        response(|out| service.obtain_by_msgid(out, Request::Article, "<first@example.com>", &state))
            .unwrap();

        let banned = service
            .invalidate_with("<first@example.com>", || Ok(service.store().ban("<first@example.com>")))
            .unwrap();
        assert!(banned);

        let err = response(|out| {
            service.obtain_by_msgid(out, Request::Article, "<first@example.com>", &state)
        })
        .unwrap_err();
        assert!(matches!(err, ArticleError::NoSuchMessageId));
    }

    #[test]
    fn test_concurrent_requests() {
        test::setup();
        let root = test::tempdir();
        let service = service(root.path());

        let responses: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let service = &service;
                    s.spawn(move || {
                        let mut state = GroupState::default();
                        service.select_group(&mut state, "misc.test").unwrap();
                        response(|out| {
                            if i % 2 == 0 {
                                service.obtain_by_number(out, Request::Body, 2, &mut state)
                            } else {
                                service.obtain_by_msgid(
                                    out,
                                    Request::Body,
                                    "<second@example.com>",
                                    &state,
                                )
                            }
                        })
                        .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for response in &responses {
            assert!(response.ends_with("line one\r\n..dotted line\r\n...\r\nlast line\r\n.\r\n"));
        }
        assert!(service.articles().is_empty());
    }
}
