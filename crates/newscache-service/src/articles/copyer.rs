use std::io::{self, Read, Write};

use crate::caching::Consumer;

use super::codes;
use super::dotwriter::DotWriter;
use super::generate::ArticleInfo;

/// Which part of an article a client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Article,
    Head,
    Body,
}

impl Part {
    fn status(self) -> (u16, &'static str) {
        match self {
            Part::Article => (codes::ARTICLE_FOLLOWS, "article"),
            Part::Head => (codes::HEAD_FOLLOWS, "head"),
            Part::Body => (codes::BODY_FOLLOWS, "body"),
        }
    }
}

/// Splits the bytes of an article at the blank line after its headers.
#[derive(Debug)]
struct Sections {
    in_headers: bool,
    at_line_start: bool,
}

impl Sections {
    fn new() -> Self {
        Self {
            in_headers: true,
            at_line_start: true,
        }
    }

    /// Returns the header bytes and the body bytes within `chunk`.
    ///
    /// The blank line that separates the two belongs to neither.
    fn split<'a>(&mut self, chunk: &'a [u8]) -> (&'a [u8], &'a [u8]) {
        if !self.in_headers {
            return (&[], chunk);
        }
        for (i, &b) in chunk.iter().enumerate() {
            if b == b'\n' {
                if self.at_line_start {
                    self.in_headers = false;
                    return (&chunk[..i], &chunk[i + 1..]);
                }
                self.at_line_start = true;
            } else if b != b'\r' {
                self.at_line_start = false;
            }
        }
        (chunk, &[])
    }
}

/// Writes an article, or a part of it, as an NNTP response.
///
/// The status line goes out only once the first bytes of the article could be read, so a
/// failed lookup or generation leaves the response untouched and the caller can still answer
/// with an error. Once started, the response is owned by this copyer: if it ends up
/// [unfinished](Self::is_broken), the connection has to be reset.
///
/// All state lives in the copyer, so when the cache hands over to another reader, it carries
/// on exactly where the previous one stopped.
#[derive(Debug)]
pub struct ArticleCopyer<W> {
    out: DotWriter<W>,
    part: Part,
    number: u64,
    sections: Sections,
    started: bool,
}

impl<W: Write> ArticleCopyer<W> {
    /// Creates a copyer announcing the article as `number` in the current group.
    pub fn new(out: W, part: Part, number: u64) -> Self {
        Self {
            out: DotWriter::new(out),
            part,
            number,
            sections: Sections::new(),
            started: false,
        }
    }

    /// Whether the status line was written.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether a response was started but not completed.
    pub fn is_broken(&self) -> bool {
        self.started && !self.out.is_finished()
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn start(&mut self, msgid: &str) -> io::Result<()> {
        let (code, what) = self.part.status();
        write!(
            self.out.get_mut(),
            "{code} {} {msgid} {what}\r\n",
            self.number
        )?;
        self.started = true;
        Ok(())
    }

    /// Writes the wanted part of `chunk`, returning `true` once the part is complete.
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<(u64, bool)> {
        let (head, body) = self.sections.split(chunk);
        let (data, complete) = match self.part {
            Part::Article => (chunk, false),
            Part::Head => (head, !self.sections.in_headers),
            Part::Body => (body, false),
        };
        self.out.write_all(data)?;
        Ok((data.len() as u64, complete))
    }
}

impl<W: Write> Consumer<ArticleInfo> for ArticleCopyer<W> {
    fn copy_from(&mut self, reader: &mut dyn Read, key: &str, _info: &ArticleInfo) -> io::Result<u64> {
        let mut buf = [0; 32 * 1024];
        let mut written = 0;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if !self.started {
                self.start(key)?;
            }

            let (n, complete) = self.write_chunk(&buf[..n])?;
            written += n;
            if complete {
                self.out.finish()?;
                return Ok(written);
            }
        }

        if !self.started {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "cached article is empty",
            ));
        }
        if self.part == Part::Head && self.sections.in_headers {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "cached article has no end of headers",
            ));
        }
        self.out.finish()?;
        Ok(written)
    }
}

/// Answers a STAT request, which only needs to know that the article resolves.
#[derive(Debug)]
pub struct StatCopyer<W> {
    out: W,
    number: u64,
    started: bool,
}

impl<W: Write> StatCopyer<W> {
    pub fn new(out: W, number: u64) -> Self {
        Self {
            out,
            number,
            started: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Consumer<ArticleInfo> for StatCopyer<W> {
    fn copy_from(&mut self, _reader: &mut dyn Read, key: &str, info: &ArticleInfo) -> io::Result<u64> {
        self.confirm_exists(key, info)?;
        Ok(0)
    }

    fn exists_only(&self) -> bool {
        true
    }

    fn confirm_exists(&mut self, key: &str, _info: &ArticleInfo) -> io::Result<()> {
        self.started = true;
        write!(self.out, "{} {} {key}\r\n", codes::ARTICLE_EXISTS, self.number)?;
        self.out.flush()
    }
}
