//! 通用工具函数

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{info, warn};
use vcm_orchestrator::Context;
use vcm_vimclient::{ManagementServer, VimClient};

use crate::config::CliConfig;

/// 已登录的服务器会话
pub struct Session {
    client: Arc<VimClient>,
    ctx: Context,
}

impl Session {
    /// 编排上下文
    pub fn context(&self) -> Context {
        self.ctx.clone()
    }

    /// 注销会话，失败只记录警告
    pub async fn close(self) {
        if let Err(e) = self.client.logout().await {
            warn!("注销会话失败: {}", e);
        }
    }
}

/// 创建客户端、登录并构建编排上下文
pub async fn connect(config: &CliConfig) -> Result<Session> {
    let server = &config.server;
    let (username, password) = server.credentials()?;

    let client = VimClient::new(&server.url, server.client.clone())
        .with_context(|| format!("无法创建管理服务器客户端: {}", server.url))?;

    client
        .login(username, password)
        .await
        .with_context(|| format!("登录管理服务器失败: {}", server.url))?;
    info!("已登录管理服务器: {}", server.url);

    let client = Arc::new(client);
    let ctx = Context::new(client.clone(), config.orchestrator.clone());

    Ok(Session { client, ctx })
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}
