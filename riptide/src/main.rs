use anyhow::Result;
use clap::Parser;
use http::{header::HeaderName, HeaderValue};
use riptide::{
    Context, Handler, HttpMethod, Middleware, MiddlewareEntry, Outcome, Request, Response,
    Server, ServerBuilder, ServerConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file (.toml or .json)
    #[clap(short, long, value_parser)]
    config: Option<String>,

    /// Override the configured port
    #[clap(short, long)]
    port: Option<u16>,
}

/// Tags every response and logs the request line with its final status.
struct AccessLog;

impl Middleware for AccessLog {
    fn post(&self, req: &Request<'_>, resp: &mut Response<'_>, _ctx: &mut Context<'_>) {
        let _ = resp.insert_header(
            HeaderName::from_static("x-riptide"),
            HeaderValue::from_static("1"),
        );
        info!(
            method = %req.method(),
            path = req.path(),
            status = resp.status().as_u16(),
            "request"
        );
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::new(8080),
    };
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    let host = config.bind_host.clone();
    let port = config.bind_port;

    let mut server = demo_server(config)?;
    let addr = server.listen(&host, port)?;
    info!("riptide demo serving on http://{addr}");
    server.join();
    Ok(())
}

fn demo_server(config: ServerConfig) -> Result<Server> {
    let mut builder = ServerBuilder::new(config);
    builder.middleware(MiddlewareEntry::post(90, AccessLog));

    builder.route(
        HttpMethod::Get,
        "/health",
        Handler::sync(|_| Ok(Outcome::json_static(b"{\"ok\":true}"))),
    )?;

    builder.route(
        HttpMethod::Get,
        "/users/{id:int}",
        Handler::sync(|req| {
            let id = req
                .path_param("id")
                .and_then(|v| v.as_int())
                .unwrap_or_default();
            Ok(Outcome::json(format!("{{\"id\":{id}}}").into_bytes()))
        }),
    )?;

    builder.route(
        HttpMethod::Get,
        "/files/{rest:path}",
        Handler::sync(|req| {
            let rest = req
                .path_param("rest")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Ok(Outcome::text(format!("requested: {rest}")))
        }),
    )?;

    builder.route(
        HttpMethod::Post,
        "/echo",
        Handler::sync(|req| Ok(Outcome::bytes(req.body().unwrap_or(&[]).to_vec()))),
    )?;

    builder.build()
}

fn load_config(path: &str) -> Result<ServerConfig> {
    let raw = std::fs::read_to_string(path)?;
    let config = if path.ends_with(".toml") {
        toml::from_str(&raw)?
    } else {
        serde_json::from_str(&raw)?
    };
    Ok(config)
}
