/*
 * vPipe mail delivery pipeline
 * Copyright (C) 2023 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

//! In-flight message representation: an ordered header and a re-readable
//! body.
//!
//! The header is deliberately not a full RFC 5322 parser: the pipeline only
//! needs ordered insertion, prepending of trace fields and case-insensitive
//! lookup. Parsing is the business of the endpoints.

/// A single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    name: String,
    value: String,
}

impl HeaderField {
    ///
    #[must_use]
    #[inline]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    ///
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    ///
    #[must_use]
    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for HeaderField {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}\r\n", self.name, self.value)
    }
}

/// Ordered header of an in-flight message.
///
/// Writers append through [`Header::add`], which preserves insertion order;
/// trace fields go on top through [`Header::prepend`]. Iteration hands out
/// references into the current snapshot; do not hold them across edits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<HeaderField>,
}

impl Header {
    ///
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field at the bottom of the header.
    #[inline]
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(HeaderField::new(name, value));
    }

    /// Append an already-built field at the bottom of the header.
    #[inline]
    pub fn add_field(&mut self, field: HeaderField) {
        self.fields.push(field);
    }

    /// Insert a trace field at the top of the header.
    #[inline]
    pub fn prepend(&mut self, field: HeaderField) {
        self.fields.insert(0, field);
    }

    /// First value of the field `name`, matched case-insensitively.
    #[must_use]
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
            .map(|field| field.value.as_str())
    }

    /// Number of occurrences of the field `name`.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.fields
            .iter()
            .filter(|field| field.name.eq_ignore_ascii_case(name))
            .count()
    }

    /// Cursor over the fields, top to bottom.
    #[inline]
    pub fn fields(&self) -> std::slice::Iter<'_, HeaderField> {
        self.fields.iter()
    }

    ///
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    ///
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for field in &self.fields {
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

impl FromIterator<HeaderField> for Header {
    fn from_iter<I: IntoIterator<Item = HeaderField>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// A re-readable message body with a length hint.
///
/// Endpoints choose the backing (memory or disk) depending on the announced
/// size; targets may open the body as many times as they need.
pub trait Body: Send + Sync {
    /// Open a fresh reader over the whole body.
    ///
    /// # Errors
    ///
    /// * the backing storage cannot be read.
    fn open(&self) -> std::io::Result<Box<dyn std::io::Read + Send + '_>>;

    /// Total size in bytes, when known.
    fn len(&self) -> Option<u64>;

    ///
    fn is_empty(&self) -> bool {
        matches!(self.len(), Some(0))
    }
}

/// Memory-backed body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBody(Vec<u8>);

impl MemoryBody {
    ///
    #[must_use]
    #[inline]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    ///
    #[must_use]
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for MemoryBody {
    #[inline]
    fn from(body: &str) -> Self {
        Self(body.as_bytes().to_vec())
    }
}

impl Body for MemoryBody {
    fn open(&self) -> std::io::Result<Box<dyn std::io::Read + Send + '_>> {
        Ok(Box::new(std::io::Cursor::new(&self.0)))
    }

    fn len(&self) -> Option<u64> {
        Some(self.0.len() as u64)
    }
}

/// Disk-backed body; the size is captured when the handle is created.
#[derive(Debug)]
pub struct FileBody {
    path: std::path::PathBuf,
    size: u64,
}

impl FileBody {
    /// Wrap an existing file.
    ///
    /// # Errors
    ///
    /// * the file metadata cannot be read.
    pub fn open(path: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        Ok(Self { path, size })
    }
}

impl Body for FileBody {
    fn open(&self) -> std::io::Result<Box<dyn std::io::Read + Send + '_>> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }

    fn len(&self) -> Option<u64> {
        Some(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read_all(body: &dyn Body) -> Vec<u8> {
        let mut buffer = Vec::new();
        std::io::Read::read_to_end(&mut body.open().unwrap(), &mut buffer).unwrap();
        buffer
    }

    #[test]
    fn header_order_is_preserved() {
        let mut header = Header::new();
        header.add("From", "a@example.com");
        header.add("To", "b@example.com");
        header.prepend(HeaderField::new("Received", "from x by y"));

        assert_eq!(
            header
                .fields()
                .map(HeaderField::name)
                .collect::<Vec<_>>(),
            vec!["Received", "From", "To"]
        );
        assert_eq!(header.get_first("FROM"), Some("a@example.com"));
        assert_eq!(header.count("received"), 1);
    }

    #[test]
    fn header_display() {
        let mut header = Header::new();
        header.add("Subject", "hi");
        assert_eq!(header.to_string(), "Subject: hi\r\n");
    }

    #[test]
    fn memory_body_rereadable() {
        let body = MemoryBody::from("foobar");
        assert_eq!(body.len(), Some(6));
        assert_eq!(read_all(&body), b"foobar");
        assert_eq!(read_all(&body), b"foobar");
    }

    #[test]
    fn file_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.eml");
        std::fs::write(&path, b"hello").unwrap();

        let body = FileBody::open(&path).unwrap();
        assert_eq!(body.len(), Some(5));
        assert_eq!(read_all(&body), b"hello");
    }
}
