//! Protocol message decoding
//!
//! Backend messages are decoded from a complete message body. The framing
//! (tag + length) is handled by the caller: the connector's read loop works
//! directly on its read buffer, while [`decode_message`] handles a whole
//! framed message held in memory.

use super::constants::{auth, tags, MAX_MESSAGE_LENGTH};
use super::message::{
    AuthenticationMessage, BackendMessage, CopyResponse, DataRowHeader, ErrorFields,
    FieldDescription, Notification, PasswordChallenge, TransactionStatus,
};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};

/// Whether `tag` is a backend message this client understands
pub fn is_known_tag(tag: u8) -> bool {
    matches!(
        tag,
        tags::AUTHENTICATION
            | tags::BACKEND_KEY_DATA
            | tags::BIND_COMPLETE
            | tags::CLOSE_COMPLETE
            | tags::COMMAND_COMPLETE
            | tags::COPY_DATA
            | tags::COPY_DONE
            | tags::COPY_IN_RESPONSE
            | tags::COPY_OUT_RESPONSE
            | tags::COPY_BOTH_RESPONSE
            | tags::DATA_ROW
            | tags::EMPTY_QUERY_RESPONSE
            | tags::ERROR_RESPONSE
            | tags::NO_DATA
            | tags::NOTICE_RESPONSE
            | tags::NOTIFICATION_RESPONSE
            | tags::PARAMETER_DESCRIPTION
            | tags::PARAMETER_STATUS
            | tags::PARSE_COMPLETE
            | tags::PORTAL_SUSPENDED
            | tags::READY_FOR_QUERY
            | tags::ROW_DESCRIPTION
    )
}

/// Validate a message header and return the body length (excluding the length field)
pub fn validate_header(tag: u8, len: i32) -> Result<usize> {
    if !is_known_tag(tag) {
        return Err(Error::Protocol(format!(
            "unexpected backend message with tag 0x{:02X} ('{}')",
            tag,
            tag.escape_ascii()
        )));
    }
    if len < 4 {
        return Err(Error::Protocol(format!(
            "invalid length {} for backend message '{}'",
            len, tag as char
        )));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_LENGTH {
        return Err(Error::Protocol(format!(
            "message length {} exceeds maximum allowed {}",
            len, MAX_MESSAGE_LENGTH
        )));
    }
    Ok(len - 4)
}

/// Decode a complete framed backend message from the front of `data`
///
/// # Returns
/// `Ok(Some((msg, consumed)))` - Message and number of bytes consumed
/// `Ok(None)` - the buffer does not hold a complete message yet
/// `Err(e)` - the message is invalid
///
/// Data rows decode to their header only; the caller owns the field bytes.
pub fn decode_message(data: &BytesMut) -> Result<Option<(BackendMessage, usize)>> {
    if data.len() < 5 {
        return Ok(None);
    }

    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let body_len = validate_header(tag, len)?;

    if data.len() < body_len + 5 {
        return Ok(None);
    }

    let body = &data[5..5 + body_len];
    let msg = if tag == tags::DATA_ROW {
        BackendMessage::DataRow(decode_data_row_header(body)?)
    } else {
        decode_body(tag, body)?
    };

    Ok(Some((msg, body_len + 5)))
}

/// Decode a message body for every tag except `DataRow`
pub fn decode_body(tag: u8, data: &[u8]) -> Result<BackendMessage> {
    let mut r = BodyReader::new(data);
    let msg = match tag {
        tags::AUTHENTICATION => decode_authentication(&mut r)?,
        tags::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
            process_id: r.i32("process id")?,
            secret_key: r.i32("secret key")?,
        },
        tags::BIND_COMPLETE => BackendMessage::BindComplete,
        tags::CLOSE_COMPLETE => BackendMessage::CloseComplete,
        tags::COMMAND_COMPLETE => BackendMessage::CommandComplete(r.cstr("command tag")?),
        tags::COPY_DATA => BackendMessage::CopyData(Bytes::copy_from_slice(data)),
        tags::COPY_DONE => BackendMessage::CopyDone,
        tags::COPY_IN_RESPONSE => BackendMessage::CopyInResponse(decode_copy_response(&mut r)?),
        tags::COPY_OUT_RESPONSE => BackendMessage::CopyOutResponse(decode_copy_response(&mut r)?),
        tags::COPY_BOTH_RESPONSE => {
            BackendMessage::CopyBothResponse(decode_copy_response(&mut r)?)
        }
        tags::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        tags::ERROR_RESPONSE => BackendMessage::ErrorResponse(decode_error_fields(&mut r)?),
        tags::NO_DATA => BackendMessage::NoData,
        tags::NOTICE_RESPONSE => BackendMessage::NoticeResponse(decode_error_fields(&mut r)?),
        tags::NOTIFICATION_RESPONSE => BackendMessage::NotificationResponse(Notification {
            process_id: r.i32("notification process id")?,
            channel: r.cstr("notification channel")?,
            payload: r.cstr("notification payload")?,
        }),
        tags::PARAMETER_DESCRIPTION => {
            let count = r.i16("parameter count")?;
            let mut oids = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                oids.push(r.i32("parameter type")? as u32);
            }
            BackendMessage::ParameterDescription(oids)
        }
        tags::PARAMETER_STATUS => BackendMessage::ParameterStatus {
            name: r.cstr("parameter name")?,
            value: r.cstr("parameter value")?,
        },
        tags::PARSE_COMPLETE => BackendMessage::ParseComplete,
        tags::PORTAL_SUSPENDED => BackendMessage::PortalSuspended,
        tags::READY_FOR_QUERY => {
            let indicator = r.u8("transaction status")?;
            let status = TransactionStatus::from_indicator(indicator).ok_or_else(|| {
                Error::Protocol(format!(
                    "unknown transaction status indicator 0x{:02X}",
                    indicator
                ))
            })?;
            BackendMessage::ReadyForQuery(status)
        }
        tags::ROW_DESCRIPTION => decode_row_description(&mut r)?,
        tags::DATA_ROW => {
            return Err(Error::Protocol(
                "data rows are read through the row view, not decoded eagerly".into(),
            ))
        }
        other => {
            return Err(Error::Protocol(format!(
                "unexpected backend message with tag 0x{:02X}",
                other
            )))
        }
    };
    Ok(msg)
}

/// Decode the 2-byte field count at the start of a data row body
pub fn decode_data_row_header(data: &[u8]) -> Result<DataRowHeader> {
    let mut r = BodyReader::new(data);
    let field_count = r.i16("field count")?;
    if field_count < 0 {
        return Err(Error::Protocol(format!(
            "negative field count {} in data row",
            field_count
        )));
    }
    Ok(DataRowHeader {
        field_count: field_count as u16,
        len: data.len() - 2,
    })
}

fn decode_authentication(r: &mut BodyReader<'_>) -> Result<BackendMessage> {
    let auth_type = r.i32("auth type")?;

    let auth_msg = match auth_type {
        auth::OK => AuthenticationMessage::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
        auth::MD5_PASSWORD => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(r.bytes(4, "salt data")?);
            AuthenticationMessage::Md5Password { salt }
        }
        auth::SHA256_PASSWORD => {
            let stored_method = r.i32("password stored method")?;
            let random_code = r.ascii(auth::RANDOM_CODE_LEN, "random code")?;
            let token = r.ascii(auth::TOKEN_LEN, "token")?;
            let iterations = if r.remaining() >= 4 {
                r.i32("iteration count")? as u32
            } else {
                auth::DEFAULT_ITERATIONS
            };
            AuthenticationMessage::Sha256Password(PasswordChallenge {
                stored_method,
                random_code,
                token,
                iterations,
            })
        }
        other => AuthenticationMessage::Other(other),
    };

    Ok(BackendMessage::Authentication(auth_msg))
}

fn decode_copy_response(r: &mut BodyReader<'_>) -> Result<CopyResponse> {
    let format = r.u8("copy format")? as i8;
    let count = r.i16("copy column count")?;
    let mut column_formats = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        column_formats.push(r.i16("copy column format")?);
    }
    Ok(CopyResponse {
        format,
        column_formats,
    })
}

fn decode_error_fields(r: &mut BodyReader<'_>) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();

    while r.remaining() > 0 {
        let field_type = r.u8("error field type")?;
        if field_type == 0 {
            break;
        }
        let value = r.cstr("error field")?;

        match field_type {
            b'S' => fields.severity = Some(value),
            // Non-localized severity (9.6+) wins over the localized one
            b'V' => fields.severity = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            b'P' => fields.position = Some(value),
            b'W' => fields.where_ = Some(value),
            b's' => fields.schema = Some(value),
            b't' => fields.table = Some(value),
            b'c' => fields.column = Some(value),
            b'n' => fields.constraint = Some(value),
            _ => {} // Ignore unknown fields
        }
    }

    Ok(fields)
}

fn decode_row_description(r: &mut BodyReader<'_>) -> Result<BackendMessage> {
    let field_count = r.i16("field count")?;
    let mut fields = Vec::with_capacity(field_count.max(0) as usize);

    for _ in 0..field_count {
        fields.push(FieldDescription {
            name: r.cstr("field name")?,
            table_oid: r.i32("table oid")?,
            column_attr: r.i16("column attribute")?,
            type_oid: r.i32("type oid")? as u32,
            type_size: r.i16("type size")?,
            type_modifier: r.i32("type modifier")?,
            format_code: r.i16("format code")?,
        });
    }

    Ok(BackendMessage::RowDescription(fields))
}

/// Bounds-checked cursor over a message body
struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Protocol(format!("truncated message: {}", what)));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.bytes(1, what)?[0])
    }

    fn i16(&mut self, what: &str) -> Result<i16> {
        let b = self.bytes(2, what)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        let b = self.bytes(4, what)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self, what: &str) -> Result<String> {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::Protocol(format!("missing null terminator in {}", what))
        })?;
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(value)
    }

    fn ascii(&mut self, n: usize, what: &str) -> Result<String> {
        let b = self.bytes(n, what)?;
        if !b.is_ascii() {
            return Err(Error::Protocol(format!("non-ASCII bytes in {}", what)));
        }
        Ok(String::from_utf8_lossy(b).into_owned())
    }
}
