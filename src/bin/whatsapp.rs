//! Aula WhatsApp 服务
//!
//! 通过 WhatsApp Cloud API 接入校园消息内核。
//!
//! 环境变量:
//! - WHATSAPP_ACCESS_TOKEN: Meta WhatsApp API 访问令牌
//! - WHATSAPP_PHONE_NUMBER_ID: 企业电话号码 ID
//! - WHATSAPP_VERIFY_TOKEN: Webhook 验证令牌 (默认 "aula")
//! - OPENAI_API_KEY: 生成端 API Key（缺省时所有轮次以兜底文案回复）
//! - AULA_CONFIG: 配置文件路径（缺省读 config/default.toml）
//! - AULA__*: 按节覆盖配置项，如 AULA__SESSION__TTL_SECS=7200
//!
//! 启动: cargo run --bin aula-whatsapp --features whatsapp

#[cfg(feature = "whatsapp")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use std::path::PathBuf;
    use std::sync::Arc;

    use aula::config::{load_config, AppConfig};
    use aula::core::{create_client_from_config, Kernel};
    use aula::integrations::whatsapp::{create_router, WhatsappSink, WhatsappState};
    use aula::llm::create_embedder;
    use aula::session::spawn_session_sweeper;
    use aula::store::create_kernel_store;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let access_token =
        std::env::var("WHATSAPP_ACCESS_TOKEN").expect("WHATSAPP_ACCESS_TOKEN must be set");
    let phone_number_id =
        std::env::var("WHATSAPP_PHONE_NUMBER_ID").expect("WHATSAPP_PHONE_NUMBER_ID must be set");

    let config_path = std::env::var("AULA_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let store = create_kernel_store(cfg.store.db_path.as_deref()).await;
    let client = create_client_from_config(&cfg);
    let embedder = create_embedder(
        cfg.llm.base_url.as_deref(),
        cfg.llm
            .embedding_model
            .as_deref()
            .unwrap_or("text-embedding-3-small"),
        cfg.llm.api_key.as_deref(),
    );
    let sink = Arc::new(WhatsappSink::new(
        access_token.clone(),
        phone_number_id.clone(),
    ));

    let sweep_interval = cfg.session.sweep_interval_secs;
    let mut builder = Kernel::builder(store, client)
        .with_config(cfg)
        .with_sink(sink);
    if let Some(embedder) = embedder {
        builder = builder.with_embedder(embedder);
    }
    let kernel = builder.build();

    spawn_session_sweeper(kernel.sessions(), sweep_interval);

    let state = Arc::new(WhatsappState::new(kernel, access_token, phone_number_id));
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 3000));
    tracing::info!("Aula WhatsApp server listening on http://{}", addr);
    tracing::info!("Webhook URL: http://YOUR_HOST:3000/webhook");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(not(feature = "whatsapp"))]
fn main() {
    eprintln!("请使用 --features whatsapp 编译: cargo run --bin aula-whatsapp --features whatsapp");
    std::process::exit(1);
}
