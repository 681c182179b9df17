//! Protocol message encoding

use super::constants::{frontend, CANCEL_REQUEST_CODE, SSL_REQUEST_CODE};
use super::message::FrontendMessage;
use bytes::{BufMut, Bytes, BytesMut};

/// Encode a frontend message into a fresh buffer
pub fn encode_message(msg: &FrontendMessage) -> BytesMut {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    encode_into(&mut buf, msg);
    buf
}

/// Encode a frontend message, appending to `buf`
pub fn encode_into(buf: &mut BytesMut, msg: &FrontendMessage) {
    match msg {
        FrontendMessage::Startup { version, params } => encode_startup(buf, *version, params),
        FrontendMessage::SslRequest => {
            buf.put_i32(8);
            buf.put_i32(SSL_REQUEST_CODE);
        }
        FrontendMessage::CancelRequest {
            process_id,
            secret_key,
        } => {
            buf.put_i32(16);
            buf.put_i32(CANCEL_REQUEST_CODE);
            buf.put_i32(*process_id);
            buf.put_i32(*secret_key);
        }
        FrontendMessage::Password(payload) => {
            with_length(buf, frontend::PASSWORD, |buf| {
                buf.put_slice(payload);
                buf.put_u8(0);
            });
        }
        FrontendMessage::Query(query) => {
            with_length(buf, frontend::QUERY, |buf| put_cstr(buf, query));
        }
        FrontendMessage::Parse {
            name,
            query,
            param_types,
        } => {
            with_length(buf, frontend::PARSE, |buf| {
                put_cstr(buf, name);
                put_cstr(buf, query);
                buf.put_i16(param_types.len() as i16);
                for oid in param_types {
                    buf.put_u32(*oid);
                }
            });
        }
        FrontendMessage::Bind {
            portal,
            statement,
            param_formats,
            params,
            result_formats,
        } => {
            with_length(buf, frontend::BIND, |buf| {
                put_cstr(buf, portal);
                put_cstr(buf, statement);
                buf.put_i16(param_formats.len() as i16);
                for f in param_formats {
                    buf.put_i16(*f);
                }
                buf.put_i16(params.len() as i16);
                for param in params {
                    match param {
                        Some(value) => {
                            buf.put_i32(value.len() as i32);
                            buf.put_slice(value);
                        }
                        None => buf.put_i32(-1),
                    }
                }
                buf.put_i16(result_formats.len() as i16);
                for f in result_formats {
                    buf.put_i16(*f);
                }
            });
        }
        FrontendMessage::Describe { target, name } => {
            with_length(buf, frontend::DESCRIBE, |buf| {
                buf.put_u8(target.code());
                put_cstr(buf, name);
            });
        }
        FrontendMessage::Execute { portal, max_rows } => {
            with_length(buf, frontend::EXECUTE, |buf| {
                put_cstr(buf, portal);
                buf.put_i32(*max_rows);
            });
        }
        FrontendMessage::Close { target, name } => {
            with_length(buf, frontend::CLOSE, |buf| {
                buf.put_u8(target.code());
                put_cstr(buf, name);
            });
        }
        FrontendMessage::Sync => empty(buf, frontend::SYNC),
        FrontendMessage::Flush => empty(buf, frontend::FLUSH),
        FrontendMessage::CopyData(data) => {
            with_length(buf, frontend::COPY_DATA, |buf| buf.put_slice(data));
        }
        FrontendMessage::CopyDone => empty(buf, frontend::COPY_DONE),
        FrontendMessage::CopyFail(reason) => {
            with_length(buf, frontend::COPY_FAIL, |buf| put_cstr(buf, reason));
        }
        FrontendMessage::Terminate => empty(buf, frontend::TERMINATE),
    }
}

/// Exact number of bytes `encode_into` appends for `msg`
pub fn encoded_len(msg: &FrontendMessage) -> usize {
    match msg {
        FrontendMessage::Startup { params, .. } => {
            4 + 4 + params
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2)
                .sum::<usize>()
                + 1
        }
        FrontendMessage::SslRequest => 8,
        FrontendMessage::CancelRequest { .. } => 16,
        FrontendMessage::Password(payload) => 5 + payload.len() + 1,
        FrontendMessage::Query(q) => 5 + q.len() + 1,
        FrontendMessage::Parse {
            name,
            query,
            param_types,
        } => 5 + name.len() + 1 + query.len() + 1 + 2 + 4 * param_types.len(),
        FrontendMessage::Bind {
            portal,
            statement,
            param_formats,
            params,
            result_formats,
        } => {
            5 + portal.len()
                + 1
                + statement.len()
                + 1
                + 2
                + 2 * param_formats.len()
                + 2
                + params
                    .iter()
                    .map(|p| 4 + p.as_ref().map_or(0, |v| v.len()))
                    .sum::<usize>()
                + 2
                + 2 * result_formats.len()
        }
        FrontendMessage::Describe { name, .. } | FrontendMessage::Close { name, .. } => {
            5 + 1 + name.len() + 1
        }
        FrontendMessage::Execute { portal, .. } => 5 + portal.len() + 1 + 4,
        FrontendMessage::Sync
        | FrontendMessage::Flush
        | FrontendMessage::CopyDone
        | FrontendMessage::Terminate => 5,
        FrontendMessage::CopyData(data) => 5 + data.len(),
        FrontendMessage::CopyFail(reason) => 5 + reason.len() + 1,
    }
}

/// Encode a sequence of messages into one immutable blob that can be replayed verbatim
pub fn pregenerate(messages: &[FrontendMessage]) -> Bytes {
    let mut buf = BytesMut::with_capacity(messages.iter().map(encoded_len).sum());
    for msg in messages {
        encode_into(&mut buf, msg);
    }
    buf.freeze()
}

fn encode_startup(buf: &mut BytesMut, version: i32, params: &[(String, String)]) {
    // Startup messages don't have a type byte
    let len_pos = buf.len();
    buf.put_i32(0);

    buf.put_i32(version);

    for (key, value) in params {
        put_cstr(buf, key);
        put_cstr(buf, value);
    }

    // Final null terminator
    buf.put_u8(0);

    let len = buf.len() - len_pos;
    buf[len_pos..len_pos + 4].copy_from_slice(&(len as i32).to_be_bytes());
}

fn with_length(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_i32(0);

    body(buf);

    let len = buf.len() - len_pos;
    buf[len_pos..len_pos + 4].copy_from_slice(&(len as i32).to_be_bytes());
}

fn empty(buf: &mut BytesMut, tag: u8) {
    buf.put_u8(tag);
    buf.put_i32(4); // Length includes itself
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put(s.as_bytes());
    buf.put_u8(0);
}
