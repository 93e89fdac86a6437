//! # 响应缓冲区
//!
//! `Response` 是只写的累加器：状态码、标头、响应体片段（或一个挂载的读取流）都先保存在
//! 内存中，直到 Dispatcher 调用 [`Response::flush`] 才一次性写到底层连接上。
//! 中间件与控制器因此可以随意写入，而不会出现交错的网络写。
//!
//! 约束：
//! - `write` 与 `pipe` 互斥，且最多只能挂载一个流。
//! - `flush` 只能调用一次，之后任何修改都会返回 `Exception::AlreadyFlushed`。

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::{
    exception::Exception,
    headers::{self, Headers},
    param::reason_phrase,
    transport::{BodyReader, RawResponse},
};

/// 生命周期回调，参数为响应自身
pub type Listener = Box<dyn FnOnce(&Response) + Send>;

pub struct Response {
    id: u128,
    status_code: u16,
    information: String,
    headers: Headers,
    chunks: Vec<Bytes>,
    stream: Option<BodyReader>,
    head_only: bool,
    flushed: bool,
    raw: RawResponse,
    finish_listeners: Vec<Listener>,
    close_listeners: Vec<Listener>,
}

impl Response {
    pub fn new(raw: RawResponse, id: u128) -> Self {
        Self {
            id,
            status_code: 200,
            information: reason_phrase(200).to_string(),
            headers: Headers::new(),
            chunks: Vec::new(),
            stream: None,
            head_only: false,
            flushed: false,
            raw,
            finish_listeners: Vec::new(),
            close_listeners: Vec::new(),
        }
    }

    /// 设置状态码，必须位于 `100..=999` 区间内。
    pub fn set_status_code(&mut self, code: u16) -> Result<&mut Self, Exception> {
        self.ensure_open()?;
        if !(100..=999).contains(&code) {
            return Err(Exception::InvalidStatusCode(code));
        }
        self.status_code = code;
        self.information = reason_phrase(code).to_string();
        Ok(self)
    }

    /// 追加一段响应体，文本会被转为字节。
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<&mut Self, Exception> {
        self.ensure_open()?;
        if self.stream.is_some() {
            return Err(Exception::WriteAfterPipe);
        }
        self.chunks.push(Bytes::copy_from_slice(data.as_ref()));
        Ok(self)
    }

    /// 把一个值序列化为 JSON 写入响应体，并设置 `content-type`。
    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<&mut Self, Exception> {
        let body = serde_json::to_vec(value).map_err(|e| Exception::handler(e.to_string()))?;
        self.set_header("content-type", "application/json")?;
        self.write(body)
    }

    /// 挂载一个读取流作为响应体，flush 时才开始读取。
    pub fn pipe<R>(&mut self, stream: R) -> Result<&mut Self, Exception>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.ensure_open()?;
        if self.stream.is_some() {
            return Err(Exception::AlreadyPiped);
        }
        if !self.chunks.is_empty() {
            return Err(Exception::PipeAfterWrite);
        }
        self.stream = Some(Box::new(stream));
        Ok(self)
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self, Exception> {
        self.ensure_open()?;
        headers::validate(name, value)?;
        self.headers.set(name, value);
        Ok(self)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// 删除标头，返回被删除的值；标头不存在时返回 `None`。
    pub fn remove_header(&mut self, name: &str) -> Result<Option<String>, Exception> {
        self.ensure_open()?;
        Ok(self.headers.remove(name))
    }

    /// 注册响应成功发送完毕后的回调。
    pub fn on_finish<F>(&mut self, listener: F) -> &mut Self
    where
        F: FnOnce(&Response) + Send + 'static,
    {
        self.finish_listeners.push(Box::new(listener));
        self
    }

    /// 注册连接被提前关闭时的回调。
    pub fn on_close<F>(&mut self, listener: F) -> &mut Self
    where
        F: FnOnce(&Response) + Send + 'static,
    {
        self.close_listeners.push(Box::new(listener));
        self
    }

    /// 将缓冲的状态、标头与响应体一次性写到底层连接，只能调用一次。
    pub async fn flush(&mut self) -> Result<(), Exception> {
        if self.flushed {
            return Err(Exception::AlreadyFlushed);
        }
        self.flushed = true;

        let result = self.emit().await;
        match &result {
            Ok(()) => {
                debug!("[ID{}]响应发送完毕，状态码{}", self.id, self.status_code);
                self.notify_finish();
            }
            Err(e) => {
                if self.raw.is_closed() {
                    warn!("[ID{}]连接被提前关闭：{}", self.id, e);
                    self.notify_close();
                }
            }
        }
        result
    }

    /// 触发并清空 finish 回调。原始响应在缓冲区之外结束（例如直接写出的错误响应）时
    /// 也由 Dispatcher 调用。
    pub(crate) fn notify_finish(&mut self) {
        let listeners = std::mem::take(&mut self.finish_listeners);
        for listener in listeners {
            listener(self);
        }
    }

    /// 触发并清空 close 回调，每个回调最多执行一次。
    pub(crate) fn notify_close(&mut self) {
        let listeners = std::mem::take(&mut self.close_listeners);
        for listener in listeners {
            listener(self);
        }
    }

    async fn emit(&mut self) -> Result<(), Exception> {
        match self.stream.take() {
            Some(mut stream) => {
                debug!("[ID{}]使用流式传输模式发送响应体", self.id);
                self.raw.write_head(self.status_code, &self.headers).await?;
                if !self.head_only {
                    let sent = self.raw.pipe_from(&mut stream).await?;
                    debug!("[ID{}]流式传输完成，共发送 {} 字节", self.id, sent);
                }
            }
            None => {
                let body = self.concat_chunks();
                if !self.headers.contains("content-length") {
                    self.headers.set("content-length", &body.len().to_string());
                }
                self.raw.write_head(self.status_code, &self.headers).await?;
                if !self.head_only && !body.is_empty() {
                    debug!("[ID{}]发送全量响应，长度: {}", self.id, body.len());
                    self.raw.write_body(&body).await?;
                }
            }
        }
        self.raw.end().await
    }

    fn concat_chunks(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.body_len());
        for chunk in &self.chunks {
            body.extend_from_slice(chunk);
        }
        body.freeze()
    }

    fn ensure_open(&self) -> Result<(), Exception> {
        match self.flushed {
            true => Err(Exception::AlreadyFlushed),
            false => Ok(()),
        }
    }

    /// HEAD 请求只发送标头。
    pub(crate) fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    pub(crate) fn raw_mut(&mut self) -> &mut RawResponse {
        &mut self.raw
    }
}

impl Response {
    pub fn id(&self) -> u128 {
        self.id
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// 已缓冲响应体的总长度
    pub fn body_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// 已缓冲响应体的拼接结果
    pub fn buffered_body(&self) -> Vec<u8> {
        self.concat_chunks().to_vec()
    }

    pub fn is_piped(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn is_finished(&self) -> bool {
        self.raw.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU16, AtomicUsize, Ordering},
        Arc,
    };
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn duplex_response() -> (Response, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (Response::new(RawResponse::new(server), 1), client)
    }

    async fn read_all(response: Response, mut client: DuplexStream) -> String {
        drop(response);
        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        output
    }

    #[test]
    fn test_response_new() {
        let (response, _client) = duplex_response();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.information(), "OK");
        assert_eq!(response.body_len(), 0);
        assert!(!response.is_flushed());
    }

    #[test]
    fn test_status_code_setter() {
        let (mut response, _client) = duplex_response();
        response.set_status_code(404).unwrap();
        assert_eq!(response.status_code(), 404);
        assert_eq!(response.information(), "Not Found");

        assert!(matches!(
            response.set_status_code(42),
            Err(Exception::InvalidStatusCode(42))
        ));
        assert!(matches!(
            response.set_status_code(1000),
            Err(Exception::InvalidStatusCode(1000))
        ));
        assert_eq!(response.status_code(), 404);
    }

    #[test]
    fn test_header_keys_case_insensitive() {
        let (mut response, _client) = duplex_response();
        response.set_header("X-A", "1").unwrap();
        assert_eq!(response.header("x-a"), Some("1"));
        assert!(response.has_header("X-a"));
        assert_eq!(response.remove_header("x-A").unwrap(), Some("1".to_string()));
        assert_eq!(response.remove_header("x-a").unwrap(), None);
        assert_eq!(response.header("x-a"), None);
        assert!(!response.has_header("x-a"));
    }

    #[test]
    fn test_header_injection_rejected() {
        let (mut response, _client) = duplex_response();
        assert!(matches!(
            response.set_header("X-A", "1\r\nSet-Cookie: evil"),
            Err(Exception::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_write_and_pipe_are_exclusive() {
        let (mut response, _client) = duplex_response();
        response.pipe(&b"stream"[..]).unwrap();
        assert!(matches!(response.write("x"), Err(Exception::WriteAfterPipe)));
        assert!(matches!(
            response.pipe(&b"again"[..]),
            Err(Exception::AlreadyPiped)
        ));

        let (mut response, _client) = duplex_response();
        response.write("x").unwrap();
        assert!(matches!(
            response.pipe(&b"stream"[..]),
            Err(Exception::PipeAfterWrite)
        ));
    }

    #[test]
    fn test_chained_writes() {
        let (mut response, _client) = duplex_response();
        response
            .set_status_code(201)
            .unwrap()
            .write("hello, ")
            .unwrap()
            .write(String::from("world"))
            .unwrap()
            .write(vec![b'!'])
            .unwrap();
        assert_eq!(response.buffered_body(), b"hello, world!".to_vec());
        assert_eq!(response.body_len(), 13);
    }

    #[tokio::test]
    async fn test_flush_buffered() {
        let (mut response, client) = duplex_response();
        response.set_header("X-Test", "yes").unwrap();
        response.write("ok").unwrap();
        response.flush().await.unwrap();
        assert!(response.is_flushed());
        assert!(response.is_finished());

        let output = read_all(response, client).await;
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("x-test: yes\r\n"));
        assert!(output.contains("content-length: 2\r\n"));
        assert!(output.ends_with("\r\n\r\nok"));
    }

    #[tokio::test]
    async fn test_flush_twice_fails() {
        let (mut response, _client) = duplex_response();
        response.flush().await.unwrap();
        assert!(matches!(
            response.flush().await,
            Err(Exception::AlreadyFlushed)
        ));
        assert!(matches!(response.write("x"), Err(Exception::AlreadyFlushed)));
        assert!(matches!(
            response.set_header("a", "b"),
            Err(Exception::AlreadyFlushed)
        ));
        assert!(matches!(
            response.set_status_code(200),
            Err(Exception::AlreadyFlushed)
        ));
    }

    #[tokio::test]
    async fn test_flush_piped_stream() {
        let (mut response, client) = duplex_response();
        response.pipe(&b"streamed body"[..]).unwrap();
        response.flush().await.unwrap();

        let output = read_all(response, client).await;
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!output.contains("content-length"));
        assert!(output.contains("connection: close\r\n"));
        assert!(output.ends_with("\r\n\r\nstreamed body"));
    }

    #[tokio::test]
    async fn test_head_only_suppresses_body() {
        let (mut response, client) = duplex_response();
        response.set_head_only(true);
        response.write("hidden").unwrap();
        response.flush().await.unwrap();

        let output = read_all(response, client).await;
        assert!(output.contains("content-length: 6\r\n"));
        assert!(output.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_write_json() {
        let (mut response, client) = duplex_response();
        response
            .write_json(&serde_json::json!({ "id": "42" }))
            .unwrap();
        response.flush().await.unwrap();

        let output = read_all(response, client).await;
        assert!(output.contains("content-type: application/json\r\n"));
        assert!(output.ends_with(r#"{"id":"42"}"#));
    }

    #[tokio::test]
    async fn test_finish_listener() {
        let (mut response, _client) = duplex_response();
        let seen = Arc::new(AtomicU16::new(0));
        let seen_clone = Arc::clone(&seen);
        response.set_status_code(204).unwrap();
        response.on_finish(move |res| seen_clone.store(res.status_code(), Ordering::SeqCst));
        response.flush().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 204);
    }

    /// 读取时总是失败的流
    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "source failed",
            )))
        }
    }

    #[tokio::test]
    async fn test_failing_source_is_not_a_closed_connection() {
        let (mut response, _client) = duplex_response();
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_clone = Arc::clone(&closed);
        response.on_close(move |_| {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        });
        response.pipe(FailingReader).unwrap();

        assert!(matches!(response.flush().await, Err(Exception::Io(_))));
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        assert!(!response.raw_mut().is_closed());
    }

    #[tokio::test]
    async fn test_close_listener_on_broken_connection() {
        let (mut response, client) = duplex_response();
        drop(client);
        let closed = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let closed_clone = Arc::clone(&closed);
        let finished_clone = Arc::clone(&finished);
        response.on_close(move |_| {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        });
        response.on_finish(move |_| {
            finished_clone.fetch_add(1, Ordering::SeqCst);
        });
        response.write("lost").unwrap();

        assert!(matches!(response.flush().await, Err(Exception::Io(_))));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(!response.is_finished());
    }
}
