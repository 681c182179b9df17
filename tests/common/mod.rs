//! Scripted in-process backend for integration tests

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use fraiseql_connector::{Settings, SettingsBuilder, SslMode};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const PROCESS_ID: i32 = 4242;
pub const SECRET_KEY: i32 = 1717;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Listener whose accepted connections are driven by test scripts
pub struct MockServer {
    listener: TcpListener,
    pub port: u16,
}

impl MockServer {
    pub async fn bind() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// Settings pointing at this server, plaintext, short timeouts
    pub fn settings(&self) -> SettingsBuilder {
        Settings::builder()
            .host("127.0.0.1")
            .port(self.port)
            .user("app")
            .database("appdb")
            .password("secret")
            .ssl_mode(SslMode::Disable)
            .connect_timeout(Duration::from_secs(5))
            .command_timeout(Some(Duration::from_secs(5)))
            .cancellation_timeout(Duration::from_millis(300))
    }

    pub async fn accept(&self) -> Backend {
        let (stream, _) = self.listener.accept().await.unwrap();
        Backend { stream }
    }

    /// Accept one session and run `script` on it
    pub fn serve<F, Fut, T>(self, script: F) -> JoinHandle<T>
    where
        F: FnOnce(Backend, MockServer) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(async move {
            let backend = self.accept().await;
            script(backend, self).await
        })
    }
}

/// Server end of one connection
pub struct Backend {
    pub stream: TcpStream,
}

impl Backend {
    /// Read the untagged startup packet and return its parameters
    pub async fn read_startup(&mut self) -> HashMap<String, String> {
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        let version = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        assert_eq!(version, 0x0003_0000, "startup protocol version");

        let mut params = HashMap::new();
        let mut parts = body[4..].split(|&b| b == 0).map(|s| String::from_utf8_lossy(s).to_string());
        while let (Some(k), Some(v)) = (parts.next(), parts.next()) {
            if k.is_empty() {
                break;
            }
            params.insert(k, v);
        }
        params
    }

    /// Read the untagged 16-byte CancelRequest; returns (pid, secret)
    pub async fn read_cancel_request(&mut self) -> (i32, i32) {
        let len = self.stream.read_i32().await.unwrap();
        assert_eq!(len, 16);
        let code = self.stream.read_i32().await.unwrap();
        assert_eq!(code, 80877102);
        let pid = self.stream.read_i32().await.unwrap();
        let secret = self.stream.read_i32().await.unwrap();
        (pid, secret)
    }

    /// Read one tagged frontend message
    pub async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let tag = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        (tag, body)
    }

    /// Read a simple Query and return its text
    pub async fn expect_query(&mut self) -> String {
        let (tag, body) = self.read_message().await;
        assert_eq!(tag, b'Q', "expected Query, got {:?}", tag as char);
        String::from_utf8(body[..body.len() - 1].to_vec()).unwrap()
    }

    /// Read a password message and return its payload
    pub async fn expect_password(&mut self) -> String {
        let (tag, body) = self.read_message().await;
        assert_eq!(tag, b'p');
        String::from_utf8(body[..body.len() - 1].to_vec()).unwrap()
    }

    pub async fn expect_sync(&mut self) {
        let (tag, body) = self.read_message().await;
        assert_eq!(tag, b'S');
        assert!(body.is_empty());
    }

    pub async fn expect_terminate(&mut self) {
        let (tag, _) = self.read_message().await;
        assert_eq!(tag, b'X');
    }

    pub async fn send(&mut self, tag: u8, body: &[u8]) {
        let mut buf = BytesMut::with_capacity(body.len() + 5);
        buf.put_u8(tag);
        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(body);
        self.stream.write_all(&buf).await.unwrap();
    }

    pub async fn auth_ok(&mut self) {
        self.send(b'R', &0i32.to_be_bytes()).await;
    }

    pub async fn auth_cleartext(&mut self) {
        self.send(b'R', &3i32.to_be_bytes()).await;
    }

    pub async fn auth_sha256(&mut self, random_code: &str, token: &str, iterations: i32) {
        let mut body = BytesMut::new();
        body.put_i32(10);
        body.put_i32(2);
        body.put_slice(random_code.as_bytes());
        body.put_slice(token.as_bytes());
        body.put_i32(iterations);
        self.send(b'R', &body).await;
    }

    pub async fn parameter_status(&mut self, name: &str, value: &str) {
        let mut body = BytesMut::new();
        put_cstr(&mut body, name);
        put_cstr(&mut body, value);
        self.send(b'S', &body).await;
    }

    pub async fn backend_key(&mut self) {
        let mut body = BytesMut::new();
        body.put_i32(PROCESS_ID);
        body.put_i32(SECRET_KEY);
        self.send(b'K', &body).await;
    }

    pub async fn ready(&mut self, status: u8) {
        self.send(b'Z', &[status]).await;
    }

    /// Parameters, backend key and ReadyForQuery after authentication
    pub async fn finish_startup(&mut self) {
        self.parameter_status("server_version", "16.2").await;
        self.parameter_status("integer_datetimes", "on").await;
        self.parameter_status("standard_conforming_strings", "on").await;
        self.backend_key().await;
        self.ready(b'I').await;
    }

    /// Accept startup with trust authentication
    pub async fn handshake(&mut self) -> HashMap<String, String> {
        let params = self.read_startup().await;
        self.auth_ok().await;
        self.finish_startup().await;
        params
    }

    pub async fn row_description(&mut self, columns: &[&str]) {
        let mut body = BytesMut::new();
        body.put_i16(columns.len() as i16);
        for name in columns {
            put_cstr(&mut body, name);
            body.put_i32(0);
            body.put_i16(0);
            body.put_u32(25);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_i16(0);
        }
        self.send(b'T', &body).await;
    }

    pub async fn data_row(&mut self, fields: &[Option<&[u8]>]) {
        let mut body = BytesMut::new();
        body.put_i16(fields.len() as i16);
        for field in fields {
            match field {
                Some(value) => {
                    body.put_i32(value.len() as i32);
                    body.put_slice(value);
                }
                None => body.put_i32(-1),
            }
        }
        self.send(b'D', &body).await;
    }

    pub async fn command_complete(&mut self, tag: &str) {
        let mut body = BytesMut::new();
        put_cstr(&mut body, tag);
        self.send(b'C', &body).await;
    }

    pub async fn error(&mut self, severity: &str, code: &str, message: &str) {
        let body = error_fields(severity, code, message);
        self.send(b'E', &body).await;
    }

    pub async fn notice(&mut self, message: &str) {
        let body = error_fields("NOTICE", "00000", message);
        self.send(b'N', &body).await;
    }

    pub async fn notification(&mut self, channel: &str, payload: &str) {
        let mut body = BytesMut::new();
        body.put_i32(PROCESS_ID);
        put_cstr(&mut body, channel);
        put_cstr(&mut body, payload);
        self.send(b'A', &body).await;
    }

    /// A one-column result `SELECT <value>` followed by ReadyForQuery
    pub async fn single_value(&mut self, value: &str) {
        self.row_description(&["?column?"]).await;
        self.data_row(&[Some(value.as_bytes())]).await;
        self.command_complete("SELECT 1").await;
        self.ready(b'I').await;
    }

    /// Wait until the client closes the connection
    pub async fn wait_closed(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn error_fields(severity: &str, code: &str, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    put_cstr(&mut body, severity);
    body.put_u8(b'V');
    put_cstr(&mut body, severity);
    body.put_u8(b'C');
    put_cstr(&mut body, code);
    body.put_u8(b'M');
    put_cstr(&mut body, message);
    body.put_u8(0);
    body
}
