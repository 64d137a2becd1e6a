//! hermit-crab 命令行
//!
//! Usage:
//! - 初始化租期: `hermit-crab init --address 203.0.113.10`
//! - 添加空闲主机: `hermit-crab add --address 203.0.113.20`
//! - 查看状态: `hermit-crab status`
//! - 手动迁移: `hermit-crab migrate [--target ADDR | --auto] [--force]`
//! - 守护进程: `hermit-crab daemon`

use clap::Parser;
use tokio_util::sync::CancellationToken;

use hermit_crab::cli::{self, Cli};
use hermit_crab::logging::{self, LogFormat};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(LogFormat::from_env()) {
        eprintln!("failed to initialize logging: {}", e);
    }

    let code = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(run(cli)),
        Err(e) => {
            eprintln!("failed to create runtime: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let cancel = CancellationToken::new();

    // Ctrl-C 只取消切换之前的阶段
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            signal_token.cancel();
        }
    });

    match cli::execute(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            let code = e.exit_code();
            tracing::error!(error = %e, exit_code = code, "Command failed");
            eprintln!("error: {:#}", anyhow::Error::new(e));
            code
        }
    }
}
