//! 快照树
//!
//! 服务器返回的嵌套快照结构被展开为以整数索引的节点数组，所有遍历都使用
//! 显式栈，不受嵌套深度影响。查找按先序进行: 根列表顺序优先，然后依次
//! 进入子节点，第一个匹配者胜出。
//!
//! 视图只是某一时刻的快照，不跨调用缓存。

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;
use vcm_vimclient::{ManagementServer, SnapshotInfo, VimError};

use crate::error::Result;

/// 节点索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// 快照节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNode {
    /// 服务器侧快照句柄
    pub handle: String,
    pub name: String,
    pub description: String,
    pub create_time: Option<DateTime<Utc>>,
    pub parent: Option<NodeId>,
    /// 子节点 (有序)
    pub children: Vec<NodeId>,
    /// 深度，根为 0
    pub depth: usize,
}

/// 虚拟机的快照森林
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotForest {
    nodes: Vec<SnapshotNode>,
    roots: Vec<NodeId>,
}

impl SnapshotForest {
    /// 从服务器的嵌套结构构建
    pub fn from_info(roots: &[SnapshotInfo]) -> Self {
        let mut forest = Self::default();
        let mut stack: Vec<(Option<NodeId>, usize, &SnapshotInfo)> =
            roots.iter().rev().map(|info| (None, 0, info)).collect();

        while let Some((parent, depth, info)) = stack.pop() {
            let id = NodeId(forest.nodes.len());
            forest.nodes.push(SnapshotNode {
                handle: info.id.clone(),
                name: info.name.clone(),
                description: info.description.clone(),
                create_time: info.create_time,
                parent,
                children: Vec::new(),
                depth,
            });
            match parent {
                Some(parent) => forest.nodes[parent.0].children.push(id),
                None => forest.roots.push(id),
            }
            stack.extend(
                info.children
                    .iter()
                    .rev()
                    .map(|child| (Some(id), depth + 1, child)),
            );
        }
        forest
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// 按索引访问节点，索引必须来自本森林
    pub fn node(&self, id: NodeId) -> &SnapshotNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&SnapshotNode> {
        self.nodes.get(id.0)
    }

    /// 先序遍历
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    /// 按名称查找，先序第一个匹配者
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if node.name == name {
                return Some(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        None
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }

    /// 所有快照名称
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.name.as_str())
    }

    /// 根快照及其直接子快照的名称
    pub fn root_summary(&self) -> BTreeMap<String, Vec<String>> {
        self.roots
            .iter()
            .map(|root| {
                let node = &self.nodes[root.0];
                let children = node
                    .children
                    .iter()
                    .map(|child| self.nodes[child.0].name.clone())
                    .collect();
                (node.name.clone(), children)
            })
            .collect()
    }

    /// 节点到根的路径名称，根在前
    pub fn path_names(&self, id: NodeId) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id.0];
            path.push(node.name.as_str());
            current = node.parent;
        }
        path.reverse();
        path
    }
}

/// 清单中所有虚拟机的快照名称
///
/// 列表与查询之间虚拟机可能被注销，这类虚拟机直接跳过。
pub async fn inventory_snapshot_names(server: &dyn ManagementServer) -> Result<HashSet<String>> {
    let mut names = HashSet::new();
    for vm_name in server.list_vm_names().await? {
        let Some(vm) = server.find_vm_by_name(&vm_name).await? else {
            continue;
        };
        let forest = match server.snapshot_forest(&vm).await {
            Ok(forest) => SnapshotForest::from_info(&forest),
            Err(VimError::NotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        names.extend(forest.names().map(str::to_string));
    }
    debug!("清单中共有 {} 个快照名称", names.len());
    Ok(names)
}

/// 清单中是否存在同名快照
pub async fn exists_name(server: &dyn ManagementServer, name: &str) -> Result<bool> {
    for vm_name in server.list_vm_names().await? {
        let Some(vm) = server.find_vm_by_name(&vm_name).await? else {
            continue;
        };
        match server.snapshot_forest(&vm).await {
            Ok(forest) => {
                if SnapshotForest::from_info(&forest).contains_name(name) {
                    return Ok(true);
                }
            }
            Err(VimError::NotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(name: &str, children: Vec<SnapshotInfo>) -> SnapshotInfo {
        SnapshotInfo {
            id: format!("id-{}", name),
            name: name.to_string(),
            description: String::new(),
            create_time: None,
            children,
        }
    }

    #[test]
    fn test_build_preserves_order_and_depth() {
        let forest = SnapshotForest::from_info(&[
            snap("a", vec![snap("a1", vec![]), snap("a2", vec![snap("a2x", vec![])])]),
            snap("b", vec![]),
        ]);

        assert_eq!(forest.len(), 5);
        assert_eq!(forest.roots().len(), 2);
        let names: Vec<_> = forest
            .preorder()
            .into_iter()
            .map(|id| forest.node(id).name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "a1", "a2", "a2x", "b"]);

        let deep = forest.find_by_name("a2x").unwrap();
        assert_eq!(forest.node(deep).depth, 2);
        assert_eq!(forest.path_names(deep), vec!["a", "a2", "a2x"]);
    }

    #[test]
    fn test_first_match_wins() {
        let forest = SnapshotForest::from_info(&[
            snap("a", vec![snap("dup", vec![])]),
            snap("dup", vec![]),
        ]);
        let found = forest.find_by_name("dup").unwrap();
        assert_eq!(forest.node(found).handle, "id-dup");
        assert_eq!(forest.node(found).depth, 1);
    }

    #[test]
    fn test_root_summary() {
        let forest = SnapshotForest::from_info(&[snap(
            "base",
            vec![snap("x", vec![snap("deep", vec![])]), snap("y", vec![])],
        )]);
        let summary = forest.root_summary();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary["base"], vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_deep_chain_without_recursion() {
        let mut chain = snap("n-0", vec![]);
        for i in 1..1000 {
            chain = snap(&format!("n-{}", i), vec![chain]);
        }
        let forest = SnapshotForest::from_info(std::slice::from_ref(&chain));
        let leaf = forest.find_by_name("n-0").unwrap();
        assert_eq!(forest.node(leaf).depth, 999);
    }
}
