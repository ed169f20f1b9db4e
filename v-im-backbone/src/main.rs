use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use v_im_backbone::gateway::Gateway;
use v_im_backbone::{Backbone, BackboneConfig};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-im-backbone gateway, router and offline worker", long_about = None)]
pub struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// 覆盖进程内网关数量 / Override the number of in-process gateways
    #[arg(short = 'g', long = "gateways")]
    gateways: Option<usize>,
}

/// 启动HTTP服务器 / Start HTTP server
fn start_http_server(
    gateway: Arc<Gateway>,
    host: &str,
    port: u16,
) -> Result<actix_web::dev::Server> {
    let addr = format!("{}:{}", host, port);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(web::Data::new(gateway.clone()))
            .configure(v_im_backbone::api::configure)
    })
    .workers(2)
    .bind(&addr)?
    .run();
    info!("🌐 HTTP server listening on http://{}", addr);
    Ok(server)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 命令行指定的文件优先级最高 / A file given on the command line wins
    let extra = match &args.config {
        Some(path) => vec![v::ConfigSource::required_file(path)],
        None => Vec::new(),
    };
    let cm = v::init_global_config_manager(extra)?;
    v::init_tracing()?;

    info!("🎯 Starting v-im-backbone...");
    for source in cm.sources_info() {
        info!(
            "🔧 config source #{} {}: {} (loaded: {})",
            source.priority, source.source_type, source.description, source.loaded
        );
    }

    let mut config = BackboneConfig::load()?;
    if let Some(n) = args.gateways {
        config.server.gateways = n.max(1);
    }

    let backbone = Backbone::start(config.clone()).await?;
    let host = config.server.host.clone();
    let mut http_handles = Vec::with_capacity(config.server.gateways);

    for index in 0..config.server.gateways {
        let (node_id, ws_port, http_port) = config.gateway_slot(index);
        let http_addr = format!("http://{}:{}", host, http_port);
        let gateway = backbone.spawn_gateway(node_id, Some(http_addr)).await?;

        let ws_gateway = gateway.clone();
        let ws_host = host.clone();
        tokio::spawn(async move {
            info!("🚀 Starting WebSocket server on {}:{}", ws_host, ws_port);
            if let Err(e) = v_im_backbone::ws::server::run(ws_gateway, &ws_host, ws_port).await {
                error!("❌ WebSocket server error: {}", e);
            }
        });

        let http_server = start_http_server(gateway, &host, http_port)?;
        http_handles.push(http_server.handle());
        tokio::spawn(async move {
            if let Err(e) = http_server.await {
                error!("❌ HTTP server error: {}", e);
            }
        });
    }

    info!("📖 WebSocket frames: auth, send, ack, ping, pull_offline");
    info!("💡 Auth: {{\"type\":\"auth\",\"token\":\"alice\",\"device_id\":\"phone\"}}");
    info!("💡 Send: {{\"type\":\"send\",\"target\":{{\"kind\":\"user\",\"id\":\"bob\"}},\"payload\":\"aGk=\"}}");

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received");
    for handle in http_handles {
        handle.stop(true).await;
    }
    backbone.shutdown().await;
    info!("✅ Server shutdown successfully");
    Ok(())
}
