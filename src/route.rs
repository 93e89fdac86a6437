//! # 路由包装模块
//!
//! `Route` 把一个编译好的 [`RoutePattern`] 与一个处理器绑定在一起，负责匹配与调用：
//! - 匹配与参数提取是路径的纯函数，没有副作用。
//! - 调用时把捕获值按声明顺序组装为 [`Params`]，执行处理器，并把各种返回形式统一为
//!   [`Completion`]。
//!
//! 处理器分两类：
//! - `Handler::Function`：单个回调，同步或异步均可。
//! - `Handler::Servelet`：按 HTTP 方法分派的能力集合（`doGet`、`doPost` ...），
//!   缺失对应方法时转交给 Dispatcher 配置的缺失路由处理器。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use log::debug;

use crate::{
    exception::Exception, param::HttpRequestMethod, pattern::RoutePattern, request::Request,
    response::Response,
};

/// 一次处理的最终结果：完成或失败。
pub type Completion = Result<(), Exception>;

/// 把处理器的返回值统一为 [`Completion`]。
///
/// `false` 被视为显式拒绝，与返回错误等价。
pub trait IntoCompletion {
    fn into_completion(self) -> Completion;
}

impl IntoCompletion for () {
    fn into_completion(self) -> Completion {
        Ok(())
    }
}

impl IntoCompletion for bool {
    fn into_completion(self) -> Completion {
        match self {
            true => Ok(()),
            false => Err(Exception::HandlerRejected),
        }
    }
}

impl<E: Into<Exception>> IntoCompletion for Result<(), E> {
    fn into_completion(self) -> Completion {
        self.map_err(Into::into)
    }
}

/// 路由参数：参数名到捕获值的映射，保持声明顺序。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, Option<String>)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// 将参数名与捕获值逐一配对。
    pub fn zip(keys: &[String], values: Vec<Option<String>>) -> Self {
        Self {
            entries: keys.iter().cloned().zip(values).collect(),
        }
    }

    /// 获取参数值。未声明的参数与未匹配的可选参数都返回 `None`。
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// 参数是否被声明（即使其值为 `None`）。
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 处理器回调。
///
/// 同一个请求的 `Request`、`Response` 与 `Params` 以引用形式传入，返回的 future
/// 完成之前它们不会被释放。
pub trait Callback: Send + Sync {
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
        params: &'a Params,
    ) -> BoxFuture<'a, Completion>;
}

struct SyncFn<F>(F);

impl<F, R> Callback for SyncFn<F>
where
    F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync,
    R: IntoCompletion,
{
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
        params: &'a Params,
    ) -> BoxFuture<'a, Completion> {
        // 回调放在 future 内部执行，这样同步 panic 也能在 poll 时被统一捕获
        Box::pin(async move { (self.0)(request, response, params).into_completion() })
    }
}

struct AsyncFn<F>(F);

impl<F> Callback for AsyncFn<F>
where
    F: for<'a> Fn(&'a Request, &'a mut Response, &'a Params) -> BoxFuture<'a, Completion>
        + Send
        + Sync,
{
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
        params: &'a Params,
    ) -> BoxFuture<'a, Completion> {
        (self.0)(request, response, params)
    }
}

/// 把同步闭包包装为回调。
pub fn sync_callback<F, R>(f: F) -> Arc<dyn Callback>
where
    F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
    R: IntoCompletion + 'static,
{
    Arc::new(SyncFn(f))
}

/// 把返回 `BoxFuture` 的闭包包装为回调。
pub fn async_callback<F>(f: F) -> Arc<dyn Callback>
where
    F: for<'a> Fn(&'a Request, &'a mut Response, &'a Params) -> BoxFuture<'a, Completion>
        + Send
        + Sync
        + 'static,
{
    Arc::new(AsyncFn(f))
}

/// 按 HTTP 方法分派的处理器集合。
#[derive(Clone, Default)]
pub struct Servelet {
    methods: HashMap<HttpRequestMethod, Arc<dyn Callback>>,
}

impl Servelet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册某个方法的回调，同一方法重复注册时后者覆盖前者。
    pub fn on(mut self, method: HttpRequestMethod, callback: Arc<dyn Callback>) -> Self {
        self.methods.insert(method, callback);
        self
    }

    pub fn get<F, R>(self, f: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
        R: IntoCompletion + 'static,
    {
        self.on(HttpRequestMethod::Get, sync_callback(f))
    }

    pub fn head<F, R>(self, f: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
        R: IntoCompletion + 'static,
    {
        self.on(HttpRequestMethod::Head, sync_callback(f))
    }

    pub fn post<F, R>(self, f: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
        R: IntoCompletion + 'static,
    {
        self.on(HttpRequestMethod::Post, sync_callback(f))
    }

    pub fn put<F, R>(self, f: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
        R: IntoCompletion + 'static,
    {
        self.on(HttpRequestMethod::Put, sync_callback(f))
    }

    pub fn delete<F, R>(self, f: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
        R: IntoCompletion + 'static,
    {
        self.on(HttpRequestMethod::Delete, sync_callback(f))
    }

    pub fn patch<F, R>(self, f: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
        R: IntoCompletion + 'static,
    {
        self.on(HttpRequestMethod::Patch, sync_callback(f))
    }

    pub fn options<F, R>(self, f: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
        R: IntoCompletion + 'static,
    {
        self.on(HttpRequestMethod::Options, sync_callback(f))
    }

    pub fn supports(&self, method: HttpRequestMethod) -> bool {
        self.methods.contains_key(&method)
    }

    fn lookup(&self, method: HttpRequestMethod) -> Option<&Arc<dyn Callback>> {
        self.methods.get(&method)
    }
}

/// 路由处理器：单个回调，或按方法分派的 Servelet。
#[derive(Clone)]
pub enum Handler {
    Function(Arc<dyn Callback>),
    Servelet(Servelet),
}

impl Handler {
    /// 同步处理器，返回 `()`、`bool` 或 `Result<(), E>`。
    pub fn from_fn<F, R>(f: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Params) -> R + Send + Sync + 'static,
        R: IntoCompletion + 'static,
    {
        Handler::Function(sync_callback(f))
    }

    /// 异步处理器，返回 `BoxFuture<'_, Completion>`。
    pub fn from_async<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Request, &'a mut Response, &'a Params) -> BoxFuture<'a, Completion>
            + Send
            + Sync
            + 'static,
    {
        Handler::Function(async_callback(f))
    }
}

impl From<Servelet> for Handler {
    fn from(servelet: Servelet) -> Self {
        Handler::Servelet(servelet)
    }
}

impl From<Arc<dyn Callback>> for Handler {
    fn from(callback: Arc<dyn Callback>) -> Self {
        Handler::Function(callback)
    }
}

/// 路由模板与处理器的绑定。
#[derive(Clone)]
pub struct Route {
    pattern: RoutePattern,
    handler: Handler,
}

impl Route {
    pub fn new(pattern: RoutePattern, handler: Handler) -> Self {
        Self { pattern, handler }
    }

    /// 编译模板并构建路由。
    pub fn compile(
        template: &str,
        case_sensitive: bool,
        handler: Handler,
    ) -> Result<Self, Exception> {
        Ok(Self::new(
            RoutePattern::compile(template, case_sensitive)?,
            handler,
        ))
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    /// 匹配并提取捕获值，与 `pattern().keys()` 一一对应。
    pub fn captures(&self, path: &str) -> Option<Vec<Option<String>>> {
        self.pattern.captures(path)
    }

    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    /// 执行处理器。
    ///
    /// 处理器返回错误、返回 `false` 或发生 panic 时，结果均为失败。Servelet 缺少
    /// 当前请求方法的能力时，改为调用 `missing_route`。
    pub async fn run(
        &self,
        values: Vec<Option<String>>,
        request: &Request,
        response: &mut Response,
        missing_route: &dyn Callback,
    ) -> Completion {
        let params = Params::zip(self.pattern.keys(), values);
        let callback: &dyn Callback = match &self.handler {
            Handler::Function(callback) => callback.as_ref(),
            Handler::Servelet(servelet) => match servelet.lookup(request.method()) {
                Some(callback) => callback.as_ref(),
                None => {
                    debug!(
                        "[ID{}]路由{}没有提供{}，转交缺失路由处理器",
                        request.id(),
                        self.pattern,
                        request.method().capability_name()
                    );
                    missing_route
                }
            },
        };
        invoke(callback, request, response, &params).await
    }
}

/// 调用回调并捕获 panic。
pub(crate) async fn invoke(
    callback: &dyn Callback,
    request: &Request,
    response: &mut Response,
    params: &Params,
) -> Completion {
    match AssertUnwindSafe(callback.call(request, response, params))
        .catch_unwind()
        .await
    {
        Ok(completion) => completion,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Exception::HandlerPanicked(message))
        }
    }
}
