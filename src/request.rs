// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求视图模块
//!
//! `Request` 是对单个入站请求的只读视图，由 Dispatcher 在请求体接收完毕后构建，
//! 并以引用形式传给每一个被调用的中间件与控制器。它包含：
//! 1. 请求方法与协议版本。
//! 2. 大小写不敏感的标头表。
//! 3. 解析后的 URL（协议、认证信息、路径、查询参数）。
//! 4. 已拼接完成的完整请求体。

use bytes::Bytes;
use url::Url;

use crate::{
    exception::Exception,
    headers::Headers,
    param::{HttpRequestMethod, HttpVersion},
};

/// 未携带 `Host` 标头时使用的主机名
const DEFAULT_HOST: &str = "localhost";

/// 表示一个完整的 HTTP 请求。构建后不可变。
#[derive(Debug, Clone)]
pub struct Request {
    /// 全局请求 ID，用于在多任务环境下追踪日志
    id: u128,
    /// HTTP 请求方法
    method: HttpRequestMethod,
    /// HTTP 协议版本
    version: HttpVersion,
    /// 请求标头
    headers: Headers,
    /// 解析后的请求目标
    url: Url,
    /// 解码后的查询参数，保持出现顺序
    query: Vec<(String, String)>,
    /// 完整的请求体
    body: Bytes,
}

impl Request {
    pub fn new(
        id: u128,
        method: HttpRequestMethod,
        version: HttpVersion,
        headers: Headers,
        url: Url,
        body: Bytes,
    ) -> Self {
        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self {
            id,
            method,
            version,
            headers,
            url,
            query,
            body,
        }
    }

    /// 将请求目标解析为绝对 URL。
    ///
    /// 请求行中的目标通常是 origin-form（`/path?query`），这里结合 `Host` 标头与协议
    /// 补全为绝对地址后再解析；absolute-form 的目标会直接覆盖主机部分。
    pub fn parse_url(target: &str, headers: &Headers, protocol: &str) -> Result<Url, Exception> {
        let host = headers
            .get("host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST);
        let base = Url::parse(&format!("{}://{}/", protocol, host))
            .map_err(|_| Exception::InvalidUrl(target.to_string()))?;
        base.join(target)
            .map_err(|_| Exception::InvalidUrl(target.to_string()))
    }
}

// --- Getter 访问器实现 ---

impl Request {
    /// 获取请求 ID
    pub fn id(&self) -> u128 {
        self.id
    }

    /// 获取请求方法
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    /// 获取 HTTP 协议版本
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// 获取全部标头
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// 按名称获取单个标头，名称大小写不敏感
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// 获取 URL 中的认证信息（`user` 或 `user:password`）
    pub fn auth(&self) -> Option<String> {
        let user = self.url.username();
        match (user.is_empty(), self.url.password()) {
            (true, None) => None,
            (_, Some(password)) => Some(format!("{}:{}", user, password)),
            (false, None) => Some(user.to_string()),
        }
    }

    /// 获取协议，例如 `http`
    pub fn protocol(&self) -> &str {
        self.url.scheme()
    }

    /// 获取请求路径（不含查询字符串）
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// 获取解码后的查询参数
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// 获取某个查询参数的第一个值
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// 获取原始查询字符串
    pub fn raw_query(&self) -> Option<&str> {
        self.url.query()
    }

    /// 获取完整 URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// 获取完整的请求体
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// 获取用户代理字符串
    pub fn user_agent(&self) -> &str {
        self.headers.get("user-agent").unwrap_or("")
    }
}
