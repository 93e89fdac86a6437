// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了路由层在注册、分发与响应输出过程中可能抛出的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：涵盖了注册期错误（路由模板、状态码、标头）、响应缓冲区的误用、
//!   处理器（handler）主动失败，以及底层传输层的协议解析错误。
//! - **语义映射**：传输层错误可以通过 [`Exception::status_code`] 转化为对应的 HTTP 状态码。
//! - **快速失败**：注册期错误直接返回给调用方，请求期错误则由 Dispatcher 在顶层统一捕获，
//!   转化为 `500 Internal Server Error`。

use std::io;

use thiserror::Error;

/// 路由层处理过程中发生的异常类型。
#[derive(Debug, Error)]
pub enum Exception {
    /// 路由模板无法编译：括号不匹配、参数名为空、内联正则非法等。
    #[error("Invalid route pattern `{template}`: {reason}")]
    PatternError { template: String, reason: String },
    /// 状态码超出 `100..=999` 的合法区间。
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),
    /// 标头名称或值不合法（例如值中包含 CR/LF）。
    #[error("Invalid header `{0}`")]
    InvalidHeader(String),
    /// 已经通过 `pipe` 挂载了流，不能再 `write`。
    #[error("Cannot write to a response that already has a piped stream")]
    WriteAfterPipe,
    /// 已经通过 `write` 写入了数据，不能再 `pipe`。
    #[error("Cannot pipe into a response that already has buffered data")]
    PipeAfterWrite,
    /// 同一个响应只能挂载一个流。
    #[error("A stream is already piped into this response")]
    AlreadyPiped,
    /// 响应只能被 flush 一次，flush 之后也不允许再修改。
    #[error("Response has already been flushed")]
    AlreadyFlushed,
    /// 处理器返回了 `false`，视为显式拒绝。
    #[error("Handler rejected the request")]
    HandlerRejected,
    /// 处理器主动返回的失败。
    #[error("Handler failed: {0}")]
    HandlerFailed(String),
    /// 处理器执行期间发生 panic。
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
    /// 客户端发送的请求头无法解析为合法的 UTF-8 字符串。
    #[error("Request bytes can't be parsed in UTF-8")]
    RequestIsNotUtf8,
    /// 请求行或标头格式不正确。
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    /// 客户端使用了服务器不认识的 HTTP 方法。
    #[error("Unsupported request method: {0}")]
    UnSupportedRequestMethod(String),
    /// 客户端使用了服务器不支持的 HTTP 协议版本。
    #[error("Unsupported HTTP version: {0}")]
    UnsupportedHttpVersion(String),
    /// 不支持的传输编码（例如 chunked）。
    #[error("Unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),
    /// 请求头超过了配置的上限。
    #[error("Request header section too large")]
    HeaderTooLarge,
    /// 请求体超过了配置的上限。
    #[error("Request body too large")]
    PayloadTooLarge,
    /// 请求目标无法解析为 URL。
    #[error("Invalid request target `{0}`")]
    InvalidUrl(String),
    /// 配置文件无法读取。
    #[error("Config error: {0}")]
    Config(String),
    /// 底层 I/O 错误（连接被提前关闭等）。
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Exception {
    /// 便捷构造：处理器以一条消息报告失败。
    pub fn handler(message: impl Into<String>) -> Self {
        Exception::HandlerFailed(message.into())
    }

    /// 将异常映射为应当返回给客户端的 HTTP 状态码。
    ///
    /// 只有传输层的协议错误才映射到 4xx/5xx 的具体值，其余一律视为 500。
    pub fn status_code(&self) -> u16 {
        match self {
            Exception::RequestIsNotUtf8
            | Exception::MalformedRequest(_)
            | Exception::InvalidUrl(_) => 400,
            Exception::PayloadTooLarge => 413,
            Exception::HeaderTooLarge => 431,
            Exception::UnSupportedRequestMethod(_)
            | Exception::UnsupportedTransferEncoding(_) => 501,
            Exception::UnsupportedHttpVersion(_) => 505,
            _ => 500,
        }
    }
}
