//! 数据存储文件 API
//!
//! 目录创建、虚拟磁盘复制、普通文件复制与删除、目录检索。

use reqwest::Method;
use tracing::info;

use crate::client::VimClient;
use crate::error::Result;
use crate::models::{DatastorePath, DiskSpec, TaskRef};

/// 数据存储文件 API
pub struct DatastoreApi<'a> {
    client: &'a VimClient,
}

impl<'a> DatastoreApi<'a> {
    pub(crate) fn new(client: &'a VimClient) -> Self {
        Self { client }
    }

    /// 创建目录 (含父目录)
    pub async fn make_directory(&self, path: &DatastorePath) -> Result<()> {
        info!("创建目录: {}", path);
        self.client
            .execute(
                Method::POST,
                "/api/v1/datastore/directory",
                Some(serde_json::json!({
                    "path": path,
                    "createParents": true,
                })),
            )
            .await
    }

    /// 复制虚拟磁盘
    pub async fn copy_disk(
        &self,
        source: &DatastorePath,
        destination: &DatastorePath,
        spec: &DiskSpec,
    ) -> Result<TaskRef> {
        info!("复制虚拟磁盘: {} -> {}", source, destination);
        self.client
            .request_task(
                Method::POST,
                "/api/v1/datastore/disk/copy",
                Some(serde_json::json!({
                    "source": source,
                    "destination": destination,
                    "spec": spec,
                    "force": true,
                })),
            )
            .await
    }

    /// 复制普通文件
    pub async fn copy_file(
        &self,
        source: &DatastorePath,
        destination: &DatastorePath,
    ) -> Result<TaskRef> {
        info!("复制文件: {} -> {}", source, destination);
        self.client
            .request_task(
                Method::POST,
                "/api/v1/datastore/file/copy",
                Some(serde_json::json!({
                    "source": source,
                    "destination": destination,
                    "force": true,
                })),
            )
            .await
    }

    /// 删除文件或目录
    pub async fn delete_file(&self, path: &DatastorePath) -> Result<TaskRef> {
        info!("删除文件: {}", path);
        self.client
            .request_task(
                Method::POST,
                "/api/v1/datastore/file/delete",
                Some(serde_json::json!({ "path": path })),
            )
            .await
    }

    /// 递归检索目录
    pub async fn search(&self, directory: &DatastorePath) -> Result<Vec<DatastorePath>> {
        info!("检索目录: {}", directory);
        self.client
            .request(
                Method::POST,
                "/api/v1/datastore/search",
                Some(serde_json::json!({ "path": directory })),
            )
            .await
    }
}
