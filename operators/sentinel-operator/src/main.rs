//! Sentinel Operator 可执行程序

use anyhow::{Context, Result};
use clap::Parser;
use sentinel_operator::config::{Cli, OperatorOptions};
use sentinel_operator::{crd, SentinelOperator};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_crds {
        print!("{}", crd::operator_crds_yaml().context("生成 CRD 失败")?);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&cli.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = OperatorOptions::load(&cli).context("加载配置失败")?;
    info!("启动 Sentinel Operator v{}", env!("CARGO_PKG_VERSION"));

    let operator = SentinelOperator::new(options)
        .await
        .context("创建 Kubernetes 客户端失败")?;
    operator.start().await.context("启动控制器失败")?;

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号，正在停止");

    operator.stop().await?;
    Ok(())
}
