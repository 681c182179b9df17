//! Borrowed data row access

use crate::{Error, Result};
use bytes::Bytes;

/// Fields of one data row, borrowed from the read buffer
///
/// Valid until the next read on the connector; the borrow checker enforces
/// that. Fields are length-prefixed (`-1` = NULL).
#[derive(Debug, Clone, Copy)]
pub struct DataRowView<'a> {
    body: &'a [u8],
    field_count: u16,
}

impl<'a> DataRowView<'a> {
    pub(crate) fn new(body: &'a [u8], field_count: u16) -> Self {
        Self { body, field_count }
    }

    /// Number of fields in the row
    pub fn len(&self) -> usize {
        self.field_count as usize
    }

    /// Whether the row has no fields
    pub fn is_empty(&self) -> bool {
        self.field_count == 0
    }

    /// Raw encoded size of the fields
    pub fn byte_len(&self) -> usize {
        self.body.len()
    }

    /// Sequential access to the fields
    pub fn iter(&self) -> Fields<'a> {
        Fields {
            rest: self.body,
            remaining: self.field_count,
        }
    }

    /// Random access to field `index` (`Ok(None)` = NULL)
    pub fn get(&self, index: usize) -> Result<Option<&'a [u8]>> {
        if index >= self.len() {
            return Err(Error::Protocol(format!(
                "field index {} out of range for row with {} fields",
                index, self.field_count
            )));
        }
        match self.iter().nth(index) {
            Some(field) => field,
            None => Err(truncated()),
        }
    }

    /// Copy every field out of the buffer
    pub fn to_owned_fields(&self) -> Result<Vec<Option<Bytes>>> {
        self.iter()
            .map(|field| field.map(|v| v.map(Bytes::copy_from_slice)))
            .collect()
    }
}

/// Iterator over the fields of a [`DataRowView`]
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    rest: &'a [u8],
    remaining: u16,
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<Option<&'a [u8]>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.rest.len() < 4 {
            self.remaining = 0;
            return Some(Err(truncated()));
        }
        let len = i32::from_be_bytes([self.rest[0], self.rest[1], self.rest[2], self.rest[3]]);
        self.rest = &self.rest[4..];
        if len < 0 {
            return Some(Ok(None));
        }
        let len = len as usize;
        if self.rest.len() < len {
            self.remaining = 0;
            return Some(Err(truncated()));
        }
        let (value, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(Ok(Some(value)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

fn truncated() -> Error {
    Error::Protocol("data row field exceeds message length".into())
}
