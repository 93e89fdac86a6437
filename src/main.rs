// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由层示例服务器
//!
//! 该程序演示如何把 `routekit` 的 Dispatcher 挂到 Tokio 监听器上：
//! - 通过 log4rs 外部 YAML 配置日志
//! - 从 TOML 文件读取运行参数
//! - 注册若干中间件与控制器（函数、异步函数、Servelet）
//! - 后台管理控制台（CLI 指令交互）

use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use log::{error, info};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Builder,
};

use routekit::{Config, Dispatcher, Exception, Handler, Servelet, Server};

/// # 程序入口点
///
/// 初始化日志、加载配置、注册路由并启动主事件循环。
fn main() {
    // 1. 初始化日志系统：采用 log4rs，通过外部 YAML 灵活配置级别与输出目的地
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
        std::process::exit(1);
    }

    // 2. 环境配置加载：从 TOML 文件读取运行参数
    let config = match Config::from_toml("config/development.toml") {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("配置文件已载入");

    // 3. 异步运行时定制：根据配置文件动态分配工作线程数
    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建异步运行时：{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("服务器异常退出：{}", e);
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> Result<(), Exception> {
    let dispatcher = build_dispatcher(&config)?;
    info!(
        "已注册{}个中间件、{}个控制器",
        dispatcher.middleware_count(),
        dispatcher.controller_count()
    );

    let server = Server::bind(config, dispatcher).await?;
    let shutdown = server.shutdown_handle();
    let active_connection = server.active_connection();

    // 启动交互式管理控制台任务，不阻塞监听循环
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut input = String::new();
        loop {
            input.clear();
            match reader.read_line(&mut input).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            match input.trim() {
                "stop" => {
                    shutdown.stop();
                    println!("停机指令已激活，服务器将停止接收新连接...");
                    break;
                }
                "help" => {
                    println!("== routekit Help ==");
                    println!("stop   - 发出停机信号");
                    println!("status - 查看当前服务器运行状态");
                    println!("help   - 显示此帮助信息");
                    println!("===================");
                }
                "status" => {
                    println!("== routekit 状态 ==");
                    println!(
                        "当前活跃连接数: {}",
                        active_connection.load(Ordering::SeqCst)
                    );
                    println!("===================");
                }
                cmd => println!("无效的命令：{}", cmd),
            }
        }
    });

    server.run().await
}

/// 注册示例路由
fn build_dispatcher(config: &Config) -> Result<Dispatcher, Exception> {
    let mut dispatcher = Dispatcher::from_config(config);

    dispatcher
        .add_middleware(Handler::from_fn(|_req, res, _params| {
            res.set_header("x-powered-by", "routekit")?;
            Ok::<(), Exception>(())
        }))
        .add_middleware(Handler::from_fn(|req, res, _params| {
            let start_time = Instant::now();
            let id = req.id();
            res.on_finish(move |res| {
                info!(
                    "[ID{}]响应状态{}，用时{}ms",
                    id,
                    res.status_code(),
                    start_time.elapsed().as_millis()
                );
            });
        }));

    dispatcher
        .add_controller(
            "/",
            Handler::from_fn(|_req, res, _params| {
                res.set_header("content-type", "text/plain;charset=utf-8")?
                    .write("routekit is running")?;
                Ok::<(), Exception>(())
            }),
        )?
        .add_controller(
            "/items/:id",
            Handler::from_fn(|_req, res, params| {
                res.write_json(&json!({ "id": params.get("id") }))?;
                Ok::<(), Exception>(())
            }),
        )?
        .add_controller(
            "/files/*",
            Handler::from_fn(|_req, res, params| {
                res.write(params.get("*").unwrap_or_default())?;
                Ok::<(), Exception>(())
            }),
        )?
        .add_controller(
            r"/slow/:ms(\d+)",
            Handler::from_async(|_req, res, params| {
                Box::pin(async move {
                    let ms: u64 = params
                        .get("ms")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms.min(10_000))).await;
                    res.write(format!("slept {}ms", ms))?;
                    Ok::<(), Exception>(())
                })
            }),
        )?
        .add_controller(
            "/echo",
            Servelet::new()
                .get(|req, res, _params| {
                    res.write_json(&json!({ "query": req.query() }))?;
                    Ok::<(), Exception>(())
                })
                .post(|req, res, _params| {
                    if let Some(content_type) = req.header("content-type") {
                        res.set_header("content-type", content_type)?;
                    }
                    res.write(req.body())?;
                    Ok::<(), Exception>(())
                }),
        )?;

    Ok(dispatcher)
}
