//! Runnable echo gateway: every protocol entry point answers with the
//! payload it received, plus the built-in HTTP health/status routes.
//!
//! ```text
//! cargo run --example echo_gateway -- --host 127.0.0.1
//! ```

use argh::FromArgs;
use shield::{Gateway, GatewayConfig, HttpResponse};

#[derive(FromArgs)]
/// Multi-protocol echo gateway.
struct Args {
    /// address to bind every listener on (default 0.0.0.0)
    #[argh(option, default = "String::from(\"0.0.0.0\")")]
    host: String,

    /// binary TCP port (default 8080)
    #[argh(option, default = "8080")]
    binary_port: u16,

    /// minimal HTTP port (default 8082)
    #[argh(option, default = "8082")]
    http_port: u16,

    /// websocket port (default 8083)
    #[argh(option, default = "8083")]
    ws_port: u16,

    /// udp port (default 8084)
    #[argh(option, default = "8084")]
    udp_port: u16,

    /// axum HTTP front-end port (default 8081)
    #[argh(option, default = "8081")]
    httpd_port: u16,

    /// slave reactors per TCP listener (default 4)
    #[argh(option, default = "4")]
    slaves: usize,
}

fn main() -> shield::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Args = argh::from_env();
    let mut config = GatewayConfig::default().with_host(args.host);
    config.binary.port = args.binary_port;
    config.binary.num_slaves = args.slaves;
    config.http.port = args.http_port;
    config.http.num_slaves = args.slaves;
    config.websocket.port = args.ws_port;
    config.websocket.num_slaves = args.slaves;
    config.http_server.port = args.httpd_port;
    config.udp.port = args.udp_port;

    let mut gateway = Gateway::new(config);
    gateway.set_message_handler(|session_id, payload| {
        Box::pin(async move {
            tracing::info!(session_id, bytes = payload.len(), "echoing binary message");
            Ok(payload)
        })
    });
    gateway.set_text_handler(|session_id, text| {
        Box::pin(async move {
            tracing::info!(session_id, %text, "echoing websocket message");
            Ok(text)
        })
    });
    gateway.add_http_route("POST", "/echo", |request| {
        HttpResponse::default().body(request.body.clone())
    })?;

    gateway.start()?;

    // Park the main thread until ctrl-c.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    gateway.stop();
    Ok(())
}
