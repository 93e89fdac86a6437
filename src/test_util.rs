//! 单元测试共用的构造函数。

use bytes::Bytes;

use crate::{
    headers::Headers, param::HttpVersion, request::Request, response::Response,
    transport::RawResponse,
};

/// 构建一个没有请求体的请求
pub fn request(method: &str, target: &str) -> Request {
    let headers = Headers::new();
    let url = Request::parse_url(target, &headers, "http").unwrap();
    Request::new(
        0,
        method.parse().unwrap(),
        HttpVersion::V1_1,
        headers,
        url,
        Bytes::new(),
    )
}

/// 构建一个写入端丢弃所有输出的响应
pub fn sink_response() -> Response {
    Response::new(RawResponse::new(tokio::io::sink()), 0)
}
