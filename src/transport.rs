//! # 原始传输层
//!
//! 这里是路由层与网络之间最薄的一层：
//! - `RequestHead` / `read_head`：从字节流中读取并解析 HTTP/1.x 请求头。
//! - `RawRequest`：解析后的请求头加上尚未读取的请求体流。
//! - `RawResponse`：只能结束一次的 HTTP/1.1 输出端，记录“标头已发送”、“已结束”、
//!   “连接已关闭”三个状态，供 Dispatcher 判断还能否写出错误响应。

use std::io;

use chrono::prelude::*;
use log::{debug, error};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    config::Config,
    exception::Exception,
    headers::Headers,
    param::*,
};

/// 转发响应流时每次读取的字节数
const PIPE_CHUNK: usize = 8192;

/// 请求体读取端
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// 响应写入端
pub type ResponseSink = Box<dyn AsyncWrite + Send + Unpin>;

/// 解析后的请求头。
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: HttpRequestMethod,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Headers,
    /// 由 `Content-Length` 给出的请求体长度，缺省为 0
    pub content_length: u64,
}

impl RequestHead {
    /// 从完整的请求头字节中解析 `RequestHead`。
    ///
    /// # 逻辑步骤
    /// 1. 验证编码：确保请求头是合法的 UTF-8 字符串。
    /// 2. 解析请求行：提取方法、目标和协议版本。
    /// 3. 逐行解析标头，同名标头按逗号合并。
    /// 4. 确定请求体长度：拒绝 chunked 编码与不一致的 `Content-Length`。
    pub fn parse(head: &[u8], id: u128) -> Result<Self, Exception> {
        // 1. 将字节流转换为字符串，失败则判定为非法的 HTTP 请求
        let request_string = match std::str::from_utf8(head) {
            Ok(string) => string,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut request_lines = request_string.lines();
        let first_line = request_lines.next().unwrap_or("");

        // 2. 解析请求行 (e.g., "GET /index.html HTTP/1.1")
        let first_line_parts: Vec<&str> = first_line.split(' ').collect();
        if first_line_parts.len() < 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, first_line);
            return Err(Exception::MalformedRequest(format!(
                "bad request line `{}`",
                first_line
            )));
        }

        let method: HttpRequestMethod = first_line_parts[0].parse()?;
        let version: HttpVersion = first_line_parts[first_line_parts.len() - 1].parse()?;

        // 考虑到目标中可能包含空格的情况，虽然不规范但通过 join 尝试恢复
        let target = if first_line_parts.len() == 3 {
            first_line_parts[1].to_string()
        } else {
            first_line_parts[1..first_line_parts.len() - 1].join(" ")
        };
        if target.is_empty() {
            return Err(Exception::MalformedRequest("empty request target".to_string()));
        }

        // 3. 迭代各行解析 Headers
        let mut headers = Headers::new();
        for line in request_lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = match line.split_once(':') {
                Some(pair) => pair,
                None => {
                    return Err(Exception::MalformedRequest(format!(
                        "bad header line `{}`",
                        line
                    )))
                }
            };
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(Exception::MalformedRequest(format!(
                    "bad header name `{}`",
                    name
                )));
            }
            headers.append(name, value.trim());
        }

        // 4. 请求体长度
        if let Some(encoding) = headers.get("transfer-encoding") {
            if !encoding.eq_ignore_ascii_case("identity") {
                return Err(Exception::UnsupportedTransferEncoding(encoding.to_string()));
            }
        }
        let content_length = match headers.get("content-length") {
            Some(value) => {
                let digits = value.trim();
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Exception::MalformedRequest(format!(
                        "bad content-length `{}`",
                        value
                    )));
                }
                digits.parse::<u64>().map_err(|_| {
                    Exception::MalformedRequest(format!("bad content-length `{}`", value))
                })?
            }
            None => 0,
        };

        Ok(Self {
            method,
            target,
            version,
            headers,
            content_length,
        })
    }
}

/// 从读取端读取一个完整的请求头（直到空行），并校验大小上限。
///
/// 读取在空行处停止，之后的字节仍留在 `reader` 中，作为请求体继续读取。
/// 连接在发送任何字节之前关闭时返回 `UnexpectedEof` 类型的 `Exception::Io`。
pub async fn read_head<R>(reader: &mut R, id: u128, config: &Config) -> Result<RequestHead, Exception>
where
    R: AsyncBufRead + Unpin,
{
    let max = config.max_header_size();
    let mut head: Vec<u8> = Vec::new();
    loop {
        let remaining = (max + 1).saturating_sub(head.len()) as u64;
        let n = (&mut *reader).take(remaining).read_until(b'\n', &mut head).await?;
        if n == 0 {
            if head.is_empty() {
                return Err(Exception::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            return Err(Exception::MalformedRequest(
                "connection closed before end of header".to_string(),
            ));
        }
        if head.len() > max {
            error!("[ID{}]请求头超过{}字节上限", id, max);
            return Err(Exception::HeaderTooLarge);
        }
        // 请求行之前的空行直接忽略
        if head == b"\r\n" || head == b"\n" {
            head.clear();
            continue;
        }
        if head.ends_with(b"\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }
    debug!("[ID{}]HTTP请求头接收完毕，共{}字节", id, head.len());

    let parsed = RequestHead::parse(&head, id)?;
    if parsed.content_length > config.max_body_size() as u64 {
        error!(
            "[ID{}]请求体长度{}超过{}字节上限",
            id,
            parsed.content_length,
            config.max_body_size()
        );
        return Err(Exception::PayloadTooLarge);
    }
    Ok(parsed)
}

/// 传输层交给 Dispatcher 的原始请求。
pub struct RawRequest {
    id: u128,
    head: RequestHead,
    protocol: String,
    body: BodyReader,
}

impl RawRequest {
    /// 以给定的请求体流构建原始请求。
    pub fn new<B>(id: u128, head: RequestHead, body: B) -> Self
    where
        B: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            id,
            head,
            protocol: "http".to_string(),
            body: Box::new(body),
        }
    }

    /// 从连接上剩余的字节流构建原始请求，请求体按 `Content-Length` 截断。
    pub fn from_stream<R>(id: u128, head: RequestHead, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let length = head.content_length;
        Self::new(id, head, reader.take(length))
    }

    /// 设置协议（例如 TLS 终止于前端时为 `https`）。
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    pub fn id(&self) -> u128 {
        self.id
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn body_mut(&mut self) -> &mut BodyReader {
        &mut self.body
    }

    pub fn into_head(self) -> RequestHead {
        self.head
    }
}

/// 原始响应输出端。状态行与标头只能写一次，结束之后不能再写入。
pub struct RawResponse {
    sink: ResponseSink,
    headers_sent: bool,
    finished: bool,
    closed: bool,
}

impl RawResponse {
    pub fn new<W>(sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: Box::new(sink),
            headers_sent: false,
            finished: false,
            closed: false,
        }
    }

    /// 状态行与标头是否已经写出
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// 响应是否已经完整结束
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 连接是否在写出过程中被提前关闭
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 写出状态行与标头。缺少 `date`、`server`、`connection` 时自动补全。
    pub async fn write_head(&mut self, status_code: u16, headers: &Headers) -> Result<(), Exception> {
        if self.headers_sent || self.finished {
            return Err(Exception::AlreadyFlushed);
        }
        let mut head = format!(
            "{} {} {}{}",
            HttpVersion::V1_1,
            status_code,
            reason_phrase(status_code),
            CRLF
        );
        for (name, value) in headers.iter() {
            head.push_str(&[name, ": ", value, CRLF].concat());
        }
        if !headers.contains("date") {
            head.push_str(&["date: ", &format_date(&Utc::now()), CRLF].concat());
        }
        if !headers.contains("server") {
            head.push_str(&["server: ", SERVER_NAME, CRLF].concat());
        }
        if !headers.contains("connection") {
            head.push_str(&["connection: close", CRLF].concat());
        }
        head.push_str(CRLF);

        self.headers_sent = true;
        let result = self.sink.write_all(head.as_bytes()).await;
        self.check(result)
    }

    /// 写出一段响应体
    pub async fn write_body(&mut self, data: &[u8]) -> Result<(), Exception> {
        if self.finished {
            return Err(Exception::AlreadyFlushed);
        }
        let result = self.sink.write_all(data).await;
        self.check(result)
    }

    /// 把读取端的全部字节转发到响应中，返回转发的字节数。
    ///
    /// 只有写入端的错误才表示连接被关闭；读取端自身的错误原样返回，不影响连接状态。
    pub async fn pipe_from(&mut self, stream: &mut BodyReader) -> Result<u64, Exception> {
        if self.finished {
            return Err(Exception::AlreadyFlushed);
        }
        let mut buffer = vec![0u8; PIPE_CHUNK];
        let mut sent: u64 = 0;
        loop {
            let n = match stream.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    error!("读取响应流失败：{}", e);
                    return Err(Exception::Io(e));
                }
            };
            let result = self.sink.write_all(&buffer[..n]).await;
            self.check(result)?;
            sent += n as u64;
        }
        Ok(sent)
    }

    /// 刷新并关闭写入端，标记响应已结束。
    pub async fn end(&mut self) -> Result<(), Exception> {
        if self.finished {
            return Err(Exception::AlreadyFlushed);
        }
        let result = self.sink.flush().await;
        self.check(result)?;
        let result = self.sink.shutdown().await;
        self.check(result)?;
        self.finished = true;
        Ok(())
    }

    /// 直接写出一个纯文本响应并结束，用于错误处理路径。
    pub async fn send_simple(&mut self, status_code: u16, body: &str) -> Result<(), Exception> {
        let mut headers = Headers::new();
        headers.set("content-type", "text/plain;charset=utf-8");
        headers.set("content-length", &body.len().to_string());
        self.write_head(status_code, &headers).await?;
        self.write_body(body.as_bytes()).await?;
        self.end().await
    }

    fn check(&mut self, result: io::Result<()>) -> Result<(), Exception> {
        result.map_err(|e| {
            self.closed = true;
            Exception::Io(e)
        })
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc2822()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn parse(text: &str) -> Result<RequestHead, Exception> {
        RequestHead::parse(text.as_bytes(), 0)
    }

    /// 验证常规 GET 请求的解析，包括目标与 Headers
    #[test]
    fn test_parse_get_request() {
        let head = parse("GET /items?id=1 HTTP/1.1\r\nHost: localhost:7878\r\nUser-Agent: Test-Browser\r\n\r\n").unwrap();
        assert_eq!(head.method, HttpRequestMethod::Get);
        assert_eq!(head.target, "/items?id=1");
        assert_eq!(head.version, HttpVersion::V1_1);
        assert_eq!(head.headers.get("user-agent"), Some("Test-Browser"));
        assert_eq!(head.content_length, 0);
    }

    /// 验证请求方法的小写兼容性处理
    #[test]
    fn test_lowercase_method() {
        let head = parse("delete /x HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(head.method, HttpRequestMethod::Delete);
        assert_eq!(head.version, HttpVersion::V1_0);
    }

    /// 确保不支持的方法与版本被正确拒绝
    #[test]
    fn test_unsupported_method_and_version() {
        assert!(matches!(
            parse("PURGE / HTTP/1.1\r\n\r\n"),
            Err(Exception::UnSupportedRequestMethod(_))
        ));
        assert!(matches!(
            parse("GET / HTTP/2.0\r\n\r\n"),
            Err(Exception::UnsupportedHttpVersion(_))
        ));
    }

    /// 验证 UTF-8 编码检查
    #[test]
    fn test_invalid_utf8() {
        assert!(matches!(
            RequestHead::parse(&[0xFF, 0xFE, 0xFD], 0),
            Err(Exception::RequestIsNotUtf8)
        ));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(parse("GET /\r\n\r\n"), Err(Exception::MalformedRequest(_))));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nNoColonHere\r\n\r\n"),
            Err(Exception::MalformedRequest(_))
        ));
    }

    /// 多个不一致的 Content-Length 会被合并为无法解析的值
    #[test]
    fn test_content_length_rules() {
        let head = parse("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n").unwrap();
        assert_eq!(head.content_length, 10);
        assert!(matches!(
            parse("POST / HTTP/1.1\r\nContent-Length: 10\r\nContent-Length: 20\r\n\r\n"),
            Err(Exception::MalformedRequest(_))
        ));
        assert!(matches!(
            parse("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"),
            Err(Exception::UnsupportedTransferEncoding(_))
        ));
    }

    /// Content-Length 只允许十进制数字
    #[test]
    fn test_content_length_digits_only() {
        for value in ["+10", "-1", "1e2", "0x10", "10 10", ""] {
            let text = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", value);
            assert!(
                matches!(parse(&text), Err(Exception::MalformedRequest(_))),
                "{}",
                value
            );
        }
        let head = parse("POST / HTTP/1.1\r\nContent-Length:  007 \r\n\r\n").unwrap();
        assert_eq!(head.content_length, 7);
    }

    #[tokio::test]
    async fn test_pipe_from_counts_bytes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut raw = RawResponse::new(server);
        let mut stream: BodyReader = Box::new(&b"piped bytes"[..]);
        assert_eq!(raw.pipe_from(&mut stream).await.unwrap(), 11);
        raw.end().await.unwrap();
        assert!(!raw.is_closed());
        drop(raw);

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "piped bytes");
    }

    #[tokio::test]
    async fn test_read_head_leaves_body() {
        let input: &[u8] = b"\r\nPOST /submit HTTP/1.1\r\nContent-Length: 10\r\n\r\ntest=valueEXTRA";
        let mut reader = BufReader::new(input);
        let head = read_head(&mut reader, 0, &Config::new()).await.unwrap();
        assert_eq!(head.target, "/submit");

        let mut raw = RawRequest::from_stream(0, head, reader);
        let mut body = Vec::new();
        raw.body_mut().read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"test=value");
    }

    #[tokio::test]
    async fn test_read_head_limits() {
        let mut config = Config::new();
        config.set_max_header_size(64);
        let long = format!("GET / HTTP/1.1\r\nX-Long: {}\r\n\r\n", "a".repeat(200));
        let mut reader = BufReader::new(long.as_bytes());
        assert!(matches!(
            read_head(&mut reader, 0, &config).await,
            Err(Exception::HeaderTooLarge)
        ));

        let mut config = Config::new();
        config.set_max_body_size(4);
        let mut reader = BufReader::new(&b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"[..]);
        assert!(matches!(
            read_head(&mut reader, 0, &config).await,
            Err(Exception::PayloadTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(matches!(
            read_head(&mut reader, 0, &Config::new()).await,
            Err(Exception::Io(_))
        ));
        let mut reader = BufReader::new(&b"GET / HTTP/1.1\r\nHost: x\r\n"[..]);
        assert!(matches!(
            read_head(&mut reader, 0, &Config::new()).await,
            Err(Exception::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_send_simple() {
        let (client, server) = tokio::io::duplex(4096);
        let mut raw = RawResponse::new(server);
        raw.send_simple(500, "Internal Server Error").await.unwrap();
        assert!(raw.is_finished());
        assert!(raw.headers_sent());
        assert!(matches!(raw.write_body(b"x").await, Err(Exception::AlreadyFlushed)));
        drop(raw);

        let mut output = String::new();
        let mut client = client;
        client.read_to_string(&mut output).await.unwrap();
        assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(output.contains("content-length: 21\r\n"));
        assert!(output.contains("server: routekit\r\n"));
        assert!(output.ends_with("\r\n\r\nInternal Server Error"));
    }
}
