use std::io::{self, Write};

/// Writes a multi-line NNTP data block.
///
/// Converts LF line endings to CRLF, doubles dots at the start of lines and terminates the
/// block with a lone dot. Carriage returns in the input are dropped, every line ends at a LF.
///
/// The writer keeps track of where in a line it is, so the input can arrive in arbitrary
/// chunks.
#[derive(Debug)]
pub struct DotWriter<W> {
    inner: W,
    at_line_start: bool,
    finished: bool,
}

impl<W: Write> DotWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            at_line_start: true,
            finished: false,
        }
    }

    /// Gives access to the underlying writer, for writing status lines.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ends the block, completing an unterminated last line first.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.at_line_start {
            self.inner.write_all(b"\r\n")?;
        }
        self.inner.write_all(b".\r\n")?;
        self.inner.flush()?;
        self.at_line_start = true;
        self.finished = true;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for DotWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::other("data block already terminated"));
        }

        let mut rest = buf;
        while !rest.is_empty() {
            if self.at_line_start && rest[0] == b'.' {
                self.inner.write_all(b".")?;
            }

            match rest.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(pos) => {
                    self.inner.write_all(&rest[..pos])?;
                    if rest[pos] == b'\n' {
                        self.inner.write_all(b"\r\n")?;
                        self.at_line_start = true;
                    } else {
                        self.at_line_start = self.at_line_start && pos == 0;
                    }
                    rest = &rest[pos + 1..];
                }
                None => {
                    self.inner.write_all(rest)?;
                    self.at_line_start = false;
                    rest = &[];
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot_encode(chunks: &[&[u8]]) -> String {
        let mut writer = DotWriter::new(Vec::new());
        for chunk in chunks {
            writer.write_all(chunk).unwrap();
        }
        writer.finish().unwrap();
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[test]
    fn test_line_endings() {
        assert_eq!(dot_encode(&[b"a\nb\n"]), "a\r\nb\r\n.\r\n");
        assert_eq!(dot_encode(&[b"a\r\nb"]), "a\r\nb\r\n.\r\n");
        assert_eq!(dot_encode(&[b""]), ".\r\n");
        assert_eq!(dot_encode(&[b"\n\n"]), "\r\n\r\n.\r\n");
    }

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(
            dot_encode(&[b"line one\n.dotted line\n..\nlast line"]),
            "line one\r\n..dotted line\r\n...\r\nlast line\r\n.\r\n"
        );
        assert_eq!(dot_encode(&[b".\n"]), "..\r\n.\r\n");
        assert_eq!(dot_encode(&[b"a.b\n"]), "a.b\r\n.\r\n");
    }

    #[test]
    fn test_split_chunks() {
        let whole = dot_encode(&[b"x\n.y\n.\nz"]);
        assert_eq!(dot_encode(&[b"x\n", b".y", b"\n", b".", b"\nz"]), whole);
        assert_eq!(dot_encode(&[b"x", b"\n", b".", b"y\n.\n", b"z"]), whole);
        assert_eq!(dot_encode(&[b"x\r", b"\n.y\r", b"\n.\nz"]), whole);
    }

    #[test]
    fn test_finish_once() {
        let mut writer = DotWriter::new(Vec::new());
        writer.write_all(b"a").unwrap();
        writer.finish().unwrap();
        writer.finish().unwrap();
        assert!(writer.is_finished());
        assert!(writer.write_all(b"b").is_err());
        assert_eq!(writer.into_inner(), b"a\r\n.\r\n");
    }
}
