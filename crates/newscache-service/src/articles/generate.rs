use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::caching::{Backend, Cache, CacheEntry, CacheError, CacheKey};

use super::store::{ArticleStore, Post, PostId};

/// What it takes to regenerate an article next to its message-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArticleInfo {
    pub post: PostId,
}

/// Assembles articles from the [`ArticleStore`] into the article cache.
pub struct ArticleBackend<S> {
    cache: Cache,
    store: Arc<S>,
}

impl<S: ArticleStore> ArticleBackend<S> {
    pub fn new(cache: Cache, store: Arc<S>) -> Self {
        Self { cache, store }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }
}

impl<S: ArticleStore> Backend for ArticleBackend<S> {
    type Info = ArticleInfo;

    fn make_filename(&self, key: &str) -> PathBuf {
        self.cache.stable_path(&CacheKey::new(key))
    }

    fn new_temp_file(&self) -> io::Result<NamedTempFile> {
        self.cache.tempfile()
    }

    #[tracing::instrument(skip(self, writer, info), fields(post = info.post))]
    fn generate(&self, writer: &mut dyn Write, key: &str, info: &ArticleInfo) -> CacheEntry {
        let post = self.store.load_post(info.post)?;
        if post.message_id != key {
            return Err(CacheError::Malformed(format!(
                "post {} has message-id {}",
                post.id, post.message_id
            )));
        }
        write_article(writer, &post)
    }
}

/// Writes the header block, a blank line and the body of `post`, with LF line endings.
///
/// `Message-ID` and `Newsgroups` are added from the stored columns unless the stored headers
/// carry them already.
pub fn write_article(writer: &mut dyn Write, post: &Post) -> CacheEntry {
    for (name, value) in &post.headers {
        check_header(name, value)?;
    }

    let has = |wanted: &str| {
        post.headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(wanted))
    };
    if !has("Message-ID") {
        writeln!(writer, "Message-ID: {}", post.message_id)?;
    }
    if !has("Newsgroups") {
        writeln!(writer, "Newsgroups: {}", post.group)?;
    }
    for (name, value) in &post.headers {
        writeln!(writer, "{name}: {value}")?;
    }
    writer.write_all(b"\n")?;

    let body = post.body.replace("\r\n", "\n");
    writer.write_all(body.as_bytes())?;
    Ok(())
}

fn check_header(name: &str, value: &str) -> CacheEntry {
    let valid_name = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':');
    if !valid_name {
        return Err(CacheError::Malformed(format!("invalid header name {name:?}")));
    }
    if value.contains(['\r', '\n']) {
        return Err(CacheError::Malformed(format!(
            "header {name} has a line break in its value"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::test;

    use super::super::store::JsonStore;
    use super::*;

    fn backend(root: &std::path::Path) -> ArticleBackend<JsonStore> {
        let store = JsonStore::from_value(test::article_store()).unwrap();
        let cache = Cache::new("articles", root).unwrap();
        ArticleBackend::new(cache, Arc::new(store))
    }

    #[test]
    fn test_generate() {
        test::setup();
        let root = test::tempdir();
        let backend = backend(root.path());

        let mut out = Vec::new();
        backend
            .generate(&mut out, "<first@example.com>", &ArticleInfo { post: 1 })
            .unwrap();

        let expected = "Message-ID: <first@example.com>\n\
                        Newsgroups: misc.test\n\
                        From: Alice <alice@example.com>\n\
                        Subject: Hello\n\
                        Date: Mon, 05 Oct 2026 12:00:00 +0000\n\
                        \n\
                        Hello world\n";
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn test_generate_errors() {
        test::setup();
        let root = test::tempdir();
        let backend = backend(root.path());

        let mut out = Vec::new();
        let banned = backend.generate(&mut out, "<banned@example.com>", &ArticleInfo { post: 3 });
        assert_eq!(banned, Err(CacheError::NotFound));

        let mismatch = backend.generate(&mut out, "<first@example.com>", &ArticleInfo { post: 2 });
        assert!(matches!(mismatch, Err(CacheError::Malformed(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_existing_headers_win() {
        let post = Post {
            id: 7,
            message_id: "<x@y>".into(),
            group: "misc.test".into(),
            number: 7,
            headers: vec![
                ("Newsgroups".into(), "misc.test,misc.other".into()),
                ("Message-Id".into(), "<x@y>".into()),
            ],
            body: "a\r\nb\r\n".into(),
            banned: false,
        };

        let mut out = Vec::new();
        write_article(&mut out, &post).unwrap();
        assert_eq!(
            out,
            b"Newsgroups: misc.test,misc.other\nMessage-Id: <x@y>\n\na\nb\n"
        );
    }

    #[test]
    fn test_malformed_headers() {
        let mut post = Post {
            id: 7,
            message_id: "<x@y>".into(),
            group: "misc.test".into(),
            number: 7,
            headers: vec![("Bad Name".into(), "value".into())],
            body: String::new(),
            banned: false,
        };
        let mut out = Vec::new();
        assert!(matches!(
            write_article(&mut out, &post),
            Err(CacheError::Malformed(_))
        ));

        post.headers = vec![("Subject".into(), "two\nlines".into())];
        assert!(matches!(
            write_article(&mut out, &post),
            Err(CacheError::Malformed(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_filenames() {
        let root = test::tempdir();
        let backend = backend(root.path());

        let a = backend.make_filename("<first@example.com>");
        let b = backend.make_filename("<second@example.com>");
        assert_ne!(a, b);
        assert!(a.starts_with(backend.cache().cache_dir()));
        assert_eq!(a.extension().unwrap(), "eml");

        let temp = backend.new_temp_file().unwrap();
        assert!(temp.path().starts_with(backend.cache().tmp_dir()));
    }
}
