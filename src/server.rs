//! # 连接监听层
//!
//! 基于 Tokio `TcpListener` 的最小监听器：每个连接派生一个任务，读取请求头，
//! 构建 `RawRequest` / `RawResponse` 后交给 [`Dispatcher::dispatch`]。
//! 每个连接只处理一个请求（`connection: close`）。

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::{
    config::Config,
    dispatcher::Dispatcher,
    exception::Exception,
    param::reason_phrase,
    transport::{read_head, RawRequest, RawResponse},
};

/// 错误响应发出后，丢弃客户端剩余输入的最长等待时间
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// 用于从其他任务中发出停机信号
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.sender.send_replace(true);
    }
}

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
    active_connection: Arc<AtomicUsize>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// 绑定监听地址。`local` 为真时只监听回环地址，端口为 0 时由系统分配。
    pub async fn bind(config: Config, dispatcher: Dispatcher) -> Result<Self, Exception> {
        let address = match config.local() {
            true => Ipv4Addr::new(127, 0, 0, 1),
            false => Ipv4Addr::new(0, 0, 0, 0),
        };
        let socket = SocketAddrV4::new(address, config.port());
        let listener = match TcpListener::bind(socket).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("无法绑定端口：{}，错误：{}", config.port(), e);
                return Err(Exception::Io(e));
            }
        };
        info!("服务端将在{}上监听Socket连接", socket);

        let (sender, _) = watch::channel(false);
        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
            config: Arc::new(config),
            active_connection: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(sender),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Exception> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: Arc::clone(&self.shutdown),
        }
    }

    /// 当前活跃连接数的共享计数器
    pub fn active_connection(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_connection)
    }

    /// 主事件循环：持续接收新连接并派发给 Tokio 任务，直到收到停机信号。
    pub async fn run(self) -> Result<(), Exception> {
        let mut shutdown = self.shutdown.subscribe();
        let mut id: u128 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("接受连接失败：{}", e);
                    continue;
                }
            };
            debug!("[ID{}]新的连接：{}", id, addr);

            let dispatcher = Arc::clone(&self.dispatcher);
            let config = Arc::clone(&self.config);
            let active_connection = Arc::clone(&self.active_connection);
            tokio::spawn(async move {
                active_connection.fetch_add(1, Ordering::SeqCst);
                handle_connection(stream, id, dispatcher, config).await;
                active_connection.fetch_sub(1, Ordering::SeqCst);
            });
            id += 1;
        }
        info!("主循环接收到停机指令，正在退出...");
        Ok(())
    }
}

/// 单个 TCP 连接的生命周期：读取请求头，交给 Dispatcher，或直接写出协议错误。
pub async fn handle_connection(
    stream: TcpStream,
    id: u128,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut raw_response = RawResponse::new(write_half);

    let timeout = Duration::from_secs(config.header_timeout_secs());
    let head = match tokio::time::timeout(timeout, read_head(&mut reader, id, &config)).await {
        Ok(Ok(head)) => head,
        Ok(Err(Exception::Io(e))) => {
            debug!("[ID{}]连接在请求头接收完毕前关闭：{}", id, e);
            return;
        }
        Ok(Err(e)) => {
            warn!("[ID{}]解析HTTP请求失败：{}", id, e);
            let status = e.status_code();
            if let Err(e) = raw_response.send_simple(status, reason_phrase(status)).await {
                debug!("[ID{}]发送错误响应失败：{}", id, e);
            }
            drain(&mut reader).await;
            return;
        }
        Err(_) => {
            warn!("[ID{}]请求头接收超时", id);
            if let Err(e) = raw_response.send_simple(408, reason_phrase(408)).await {
                debug!("[ID{}]发送错误响应失败：{}", id, e);
            }
            return;
        }
    };
    debug!("[ID{}]成功解析HTTP请求头：{} {}", id, head.method, head.target);

    let raw_request = RawRequest::from_stream(id, head, reader);
    dispatcher.dispatch(raw_request, raw_response).await;
}

/// 读取并丢弃客户端尚未发送完的数据，避免关闭连接时触发 RST 导致响应丢失。
async fn drain(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) {
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, tokio::io::copy(reader, &mut tokio::io::sink())).await;
}
