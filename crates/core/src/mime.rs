//! MIME type checks for assembled artifacts.
//!
//! Declared types are compared against the filename extension and, for
//! binary formats, against the leading magic bytes. Text types must decode
//! as UTF-8. Content is fed incrementally so callers can validate while
//! streaming.

use crate::{Error, Result};

const PDF_MAGIC: &[u8] = b"%PDF-";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const RTF_MAGIC: &[u8] = b"{\\rtf";

const HEAD_LEN: usize = 8;

/// Lowercased MIME essence with parameters stripped ("text/plain; charset=x" -> "text/plain").
pub fn essence(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Check that the declared type is plausible for the filename.
///
/// Unknown extensions and `application/octet-stream` are accepted.
pub fn check_filename(filename: &str, declared: &str) -> Result<()> {
    let declared = essence(declared);
    if declared == "application/octet-stream" {
        return Ok(());
    }
    let guesses = mime_guess::from_path(filename);
    if guesses.is_empty() {
        return Ok(());
    }
    if guesses.iter().any(|g| g.essence_str() == declared) {
        return Ok(());
    }
    Err(Error::Validation(format!(
        "declared type {declared} does not match filename {filename} (expected {})",
        guesses.first_raw().unwrap_or("unknown")
    )))
}

fn expected_magic(mime: &str) -> Option<&'static [u8]> {
    match mime {
        "application/pdf" => Some(PDF_MAGIC),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            Some(ZIP_MAGIC)
        }
        "application/msword" => Some(OLE_MAGIC),
        "application/rtf" | "text/rtf" => Some(RTF_MAGIC),
        _ => None,
    }
}

fn is_text(mime: &str) -> bool {
    mime.starts_with("text/") || mime == "application/json"
}

/// Incremental content validator.
pub struct ContentValidator {
    mime: String,
    head: Vec<u8>,
    check_utf8: bool,
    /// Trailing bytes of an incomplete UTF-8 sequence from the previous update.
    pending: Vec<u8>,
    seen: u64,
}

impl ContentValidator {
    /// Create a validator for `declared` content named `filename`.
    ///
    /// Fails immediately if the type disagrees with the filename.
    pub fn new(filename: &str, declared: &str) -> Result<Self> {
        check_filename(filename, declared)?;
        let mime = essence(declared);
        let check_utf8 = is_text(&mime);
        Ok(Self {
            mime,
            head: Vec::with_capacity(HEAD_LEN),
            check_utf8,
            pending: Vec::new(),
            seen: 0,
        })
    }

    /// Feed the next slice of content.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        if self.head.len() < HEAD_LEN {
            let take = (HEAD_LEN - self.head.len()).min(data.len());
            self.head.extend_from_slice(&data[..take]);
        }

        if self.check_utf8 && !data.is_empty() {
            let mut buf = std::mem::take(&mut self.pending);
            let buf_start = self.seen - buf.len() as u64;
            buf.extend_from_slice(data);
            match std::str::from_utf8(&buf) {
                Ok(_) => {}
                Err(e) if e.error_len().is_none() => {
                    self.pending = buf[e.valid_up_to()..].to_vec();
                }
                Err(e) => {
                    return Err(Error::Validation(format!(
                        "{} content is not valid UTF-8 at byte {}",
                        self.mime,
                        buf_start + e.valid_up_to() as u64
                    )));
                }
            }
        }

        self.seen += data.len() as u64;
        Ok(())
    }

    /// Finish validation after all content has been fed.
    pub fn finish(&self) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(Error::Validation(format!(
                "{} content ends inside a UTF-8 sequence",
                self.mime
            )));
        }
        if let Some(magic) = expected_magic(&self.mime)
            && !self.head.starts_with(magic)
        {
            return Err(Error::Validation(format!(
                "content does not look like {}",
                self.mime
            )));
        }
        Ok(())
    }
}

/// Validate a complete buffer in one call.
pub fn validate_content(filename: &str, declared: &str, data: &[u8]) -> Result<()> {
    let mut validator = ContentValidator::new(filename, declared)?;
    validator.update(data)?;
    validator.finish()
}
