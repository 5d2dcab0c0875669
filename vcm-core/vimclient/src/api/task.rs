//! 异步任务 API

use reqwest::Method;
use tracing::debug;

use crate::client::VimClient;
use crate::error::Result;
use crate::models::{TaskInfo, TaskRef};

/// 异步任务 API
pub struct TaskApi<'a> {
    client: &'a VimClient,
}

impl<'a> TaskApi<'a> {
    pub(crate) fn new(client: &'a VimClient) -> Self {
        Self { client }
    }

    /// 获取任务状态
    pub async fn info(&self, task: &TaskRef) -> Result<TaskInfo> {
        debug!("查询任务状态: {}", task);
        self.client
            .request(
                Method::GET,
                &format!("/api/v1/task/{}", urlencoding::encode(task.as_str())),
                None::<()>,
            )
            .await
    }
}
