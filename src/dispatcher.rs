//! # 请求分发器
//!
//! `Dispatcher` 持有按注册顺序排列的中间件与控制器，以及一个缺失路由处理器。
//! 每个请求依次经过以下阶段：
//!
//! ```text
//! ACCUMULATING_BODY -> RUNNING_MIDDLEWARE -> RUNNING_CONTROLLER -> FLUSHING -> DONE
//!                           \___________________|___________________/
//!                                               v
//!                                  FAILED -> 直接写出 500 -> DONE
//! ```
//!
//! - 中间件严格按注册顺序串行执行，前一个完成之后才开始下一个。
//! - 控制器按注册顺序查找，只调用第一个匹配的；都不匹配时调用缺失路由处理器。
//! - 任何阶段失败都会在顶层被捕获一次，绕过响应缓冲区直接在原始连接上写出
//!   `500 Internal Server Error`，除非原始响应已经结束。

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;

use crate::{
    config::Config,
    exception::Exception,
    param::{reason_phrase, HttpRequestMethod},
    pattern::RoutePattern,
    request::Request,
    response::Response,
    route::{invoke, sync_callback, Callback, Completion, Handler, Params, Route},
    transport::{BodyReader, RawRequest, RawResponse},
};

/// 每次从请求体读取端预留的缓冲区大小
const READ_CHUNK: usize = 8192;

pub struct Dispatcher {
    middleware: Vec<Route>,
    controllers: Vec<Route>,
    missing_route: Arc<dyn Callback>,
    case_sensitive: bool,
    max_body_size: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// 默认的缺失路由处理器：`404 Not Found`
fn not_found() -> Arc<dyn Callback> {
    sync_callback(|_req, res: &mut Response, _params| -> Completion {
        res.set_status_code(404)?.write("Not Found")?;
        Ok(())
    })
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
            controllers: Vec::new(),
            missing_route: not_found(),
            case_sensitive: false,
            max_body_size: Config::new().max_body_size(),
        }
    }

    /// 按配置构建：路由大小写敏感性与请求体上限取自配置。
    pub fn from_config(config: &Config) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.case_sensitive = config.case_sensitive_routing();
        dispatcher.max_body_size = config.max_body_size();
        dispatcher
    }

    /// 设置之后注册的路由模板是否大小写敏感
    pub fn set_case_sensitive(&mut self, case_sensitive: bool) -> &mut Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn set_max_body_size(&mut self, size: usize) -> &mut Self {
        self.max_body_size = size;
        self
    }

    /// 注册作用于所有路径的中间件。
    pub fn add_middleware(&mut self, handler: impl Into<Handler>) -> &mut Self {
        self.add_middleware_with_pattern(RoutePattern::any(), handler)
    }

    /// 注册作用于指定路由模板的中间件。模板非法时立即返回错误。
    pub fn add_middleware_at(
        &mut self,
        pattern: &str,
        handler: impl Into<Handler>,
    ) -> Result<&mut Self, Exception> {
        let pattern = RoutePattern::compile(pattern, self.case_sensitive)?;
        Ok(self.add_middleware_with_pattern(pattern, handler))
    }

    pub fn add_middleware_with_pattern(
        &mut self,
        pattern: RoutePattern,
        handler: impl Into<Handler>,
    ) -> &mut Self {
        debug!("注册中间件：{}", pattern);
        self.middleware.push(Route::new(pattern, handler.into()));
        self
    }

    /// 注册控制器。模板非法时立即返回错误。
    pub fn add_controller(
        &mut self,
        pattern: &str,
        handler: impl Into<Handler>,
    ) -> Result<&mut Self, Exception> {
        let pattern = RoutePattern::compile(pattern, self.case_sensitive)?;
        Ok(self.add_controller_with_pattern(pattern, handler))
    }

    /// 注册匹配所有路径的控制器。
    pub fn add_controller_any(&mut self, handler: impl Into<Handler>) -> &mut Self {
        self.add_controller_with_pattern(RoutePattern::any(), handler)
    }

    pub fn add_controller_with_pattern(
        &mut self,
        pattern: RoutePattern,
        handler: impl Into<Handler>,
    ) -> &mut Self {
        debug!("注册控制器：{}", pattern);
        self.controllers.push(Route::new(pattern, handler.into()));
        self
    }

    /// 替换缺失路由处理器。
    pub fn set_missing_route_controller(&mut self, callback: Arc<dyn Callback>) -> &mut Self {
        self.missing_route = callback;
        self
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.len()
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// 处理一个请求直到响应结束。可直接用作连接层的请求处理函数。
    pub async fn dispatch(&self, raw_request: RawRequest, raw_response: RawResponse) {
        let id = raw_request.id();
        let start_time = Instant::now();
        let mut response = Response::new(raw_response, id);

        match self.process(raw_request, &mut response).await {
            Ok(()) => debug!(
                "[ID{}]请求处理完成，服务端用时{}ms",
                id,
                start_time.elapsed().as_millis()
            ),
            Err(e) => {
                error!("[ID{}]处理请求时发生异常：{}", id, e);
                let raw = response.raw_mut();
                if raw.is_finished() || raw.is_closed() || raw.headers_sent() {
                    warn!("[ID{}]响应已结束，无法再发送错误响应", id);
                    return;
                }
                let status = e.status_code();
                match raw.send_simple(status, reason_phrase(status)).await {
                    // 错误响应同样是原始响应的结束，生命周期回调需要看到它
                    Ok(()) => response.notify_finish(),
                    Err(e) => {
                        warn!("[ID{}]发送错误响应失败：{}", id, e);
                        if response.raw_mut().is_closed() {
                            response.notify_close();
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, mut raw_request: RawRequest, response: &mut Response) -> Completion {
        let id = raw_request.id();

        // 1. 接收完整的请求体
        debug!("[ID{}]ACCUMULATING_BODY", id);
        let expected = raw_request.head().content_length;
        let body =
            accumulate_body(raw_request.body_mut(), expected, self.max_body_size, id).await?;
        let protocol = raw_request.protocol().to_string();
        let head = raw_request.into_head();
        let url = Request::parse_url(&head.target, &head.headers, &protocol)?;
        let request = Request::new(id, head.method, head.version, head.headers, url, body);
        response.set_head_only(request.method() == HttpRequestMethod::Head);

        // 2. 串行执行所有匹配的中间件
        debug!("[ID{}]RUNNING_MIDDLEWARE", id);
        self.run_middleware(&request, response).await?;

        // 3. 执行第一个匹配的控制器
        debug!("[ID{}]RUNNING_CONTROLLER", id);
        self.run_controller(&request, response).await?;

        // 4. 输出响应
        debug!("[ID{}]FLUSHING", id);
        response.flush().await?;

        info!(
            "[ID{}] {}, {}, {}, {}, {}, {}",
            id,
            request.version(),
            request.path(),
            request.method(),
            response.status_code(),
            response.information(),
            request.user_agent(),
        );
        Ok(())
    }

    async fn run_middleware(&self, request: &Request, response: &mut Response) -> Completion {
        for route in &self.middleware {
            if let Some(values) = route.captures(request.path()) {
                debug!("[ID{}]执行中间件：{}", request.id(), route.pattern());
                route
                    .run(values, request, response, self.missing_route.as_ref())
                    .await?;
            }
        }
        Ok(())
    }

    async fn run_controller(&self, request: &Request, response: &mut Response) -> Completion {
        for route in &self.controllers {
            if let Some(values) = route.captures(request.path()) {
                debug!("[ID{}]匹配控制器：{}", request.id(), route.pattern());
                return route
                    .run(values, request, response, self.missing_route.as_ref())
                    .await;
            }
        }
        warn!("[ID{}]请求的路径：{} 没有匹配的控制器", request.id(), request.path());
        invoke(self.missing_route.as_ref(), request, response, &Params::new()).await
    }
}

/// 逐块读取请求体直到结束，并拼接为一个不可变的缓冲区。
///
/// 读取端在 `expected` 字节之前结束说明对端提前断开，请求体不完整。
async fn accumulate_body(
    body: &mut BodyReader,
    expected: u64,
    limit: usize,
    id: u128,
) -> Result<Bytes, Exception> {
    let mut buffer = BytesMut::new();
    loop {
        buffer.reserve(READ_CHUNK);
        let n = body.read_buf(&mut buffer).await?;
        if n == 0 {
            break;
        }
        if buffer.len() > limit {
            error!("[ID{}]请求体超过{}字节上限", id, limit);
            return Err(Exception::PayloadTooLarge);
        }
    }
    if (buffer.len() as u64) < expected {
        error!(
            "[ID{}]请求体不完整：声明{}字节，实际收到{}字节",
            id,
            expected,
            buffer.len()
        );
        return Err(Exception::MalformedRequest(
            "body shorter than content-length".to_string(),
        ));
    }
    debug!("[ID{}]请求体接收完毕，共{}字节", id, buffer.len());
    Ok(buffer.freeze())
}
