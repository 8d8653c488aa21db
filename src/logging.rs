//! tracing 订阅器初始化
//!
//! `RUST_LOG` 优先于配置中的 `level`。重复初始化返回错误而不是 panic，
//! 测试和嵌入方可以放心多次调用。

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
    }
    .context("global tracing subscriber already installed")
}

fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level directive `{}`", config.level)),
    }
}
