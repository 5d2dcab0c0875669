//! 快照与名称分配测试

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use vcm_orchestrator::snapshot_tree::{exists_name, inventory_snapshot_names};
use vcm_orchestrator::*;
use vcm_vimclient::{InMemoryServer, ManagementServer, VmFixture};

fn snapshotted() -> InMemoryServer {
    InMemoryServer::builder()
        .vm(VmFixture::new("master")
            .snapshot("base", None)
            .snapshot("child-a", Some("base"))
            .snapshot("leaf-a", Some("child-a"))
            .snapshot("child-b", Some("base"))
            .snapshot("grand", Some("child-b"))
            .snapshot("deep", Some("grand")))
        .vm(VmFixture::new("agent1").snapshot("agent-base", None))
        .build()
}

/// 依次返回给定名称的生成器
fn sequence(names: &[&str]) -> impl Fn() -> String + Send + Sync + 'static {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let next = Arc::new(AtomicUsize::new(0));
    move || {
        let i = next.fetch_add(1, Ordering::SeqCst);
        names[i.min(names.len() - 1)].clone()
    }
}

#[tokio::test]
async fn test_forest_find_at_depth_three() {
    let h = Harness::new(snapshotted());
    let forest = SnapshotOps::new(h.ctx.clone())
        .forest("master")
        .await
        .unwrap();

    assert_eq!(forest.len(), 6);
    let id = forest.find_by_name("deep").unwrap();
    let node = forest.node(id);
    assert_eq!(node.depth, 3);
    assert_eq!(forest.path_names(id), vec!["base", "child-b", "grand", "deep"]);

    // 多次查找返回同一节点
    assert_eq!(forest.find_by_name("deep"), Some(id));
    assert!(forest.find_by_name("agent-base").is_none());
}

#[tokio::test]
async fn test_list_roots_and_children() {
    let h = Harness::new(snapshotted());
    let ops = SnapshotOps::new(h.ctx.clone());

    let listing = ops.list("master").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(
        listing["base"],
        vec!["child-a".to_string(), "child-b".to_string()]
    );

    let h = Harness::new(inventory());
    assert!(SnapshotOps::new(h.ctx.clone())
        .list("master")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_inventory_wide_snapshot_names() {
    let h = Harness::new(snapshotted());
    let server: &dyn ManagementServer = h.server.as_ref();

    let names = inventory_snapshot_names(server).await.unwrap();
    assert_eq!(names.len(), 7);
    assert!(names.contains("agent-base"));
    assert!(exists_name(server, "grand").await.unwrap());
    assert!(!exists_name(server, "missing").await.unwrap());
}

#[tokio::test]
async fn test_create_with_generated_name() {
    let h = Harness::new(inventory());
    let ops = SnapshotOps::new(h.ctx.clone());

    let name = ops.create("master", None, None, false).await.unwrap();
    assert!(is_hex_name(&name));

    let forest = ops.forest("master").await.unwrap();
    let node = forest.node(forest.find_by_name(&name).unwrap());
    assert_eq!(node.description, name);
    assert!(h.ctx.leases().is_empty());
}

#[tokio::test]
async fn test_create_with_name_checks_namespace() {
    let h = Harness::new(snapshotted());
    let ops = SnapshotOps::new(h.ctx.clone());

    for taken in ["agent1", "agent-base"] {
        let err = ops.create("master", Some(taken), None, false).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NameCollision(_)));
    }

    let name = ops
        .create("master", Some("agent-base"), Some("复用名称"), true)
        .await
        .unwrap();
    assert_eq!(name, "agent-base");
    assert!(ops.forest("master").await.unwrap().contains_name("agent-base"));

    let name = ops
        .create("master", Some("nightly"), Some("每日快照"), false)
        .await
        .unwrap();
    assert_eq!(name, "nightly");
}

#[tokio::test]
async fn test_create_on_missing_vm() {
    let h = Harness::new(inventory());
    let err = SnapshotOps::new(h.ctx.clone())
        .create("ghost", Some("x"), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_revert() {
    let h = Harness::new(snapshotted());
    let ops = SnapshotOps::new(h.ctx.clone());

    ops.revert("master", "child-a").await.unwrap();
    assert_eq!(h.server.call_count("revert_snapshot"), 1);

    let err = ops.revert("master", "agent-base").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_rename() {
    let h = Harness::new(snapshotted());
    let ops = SnapshotOps::new(h.ctx.clone());

    let name = ops
        .rename("master", "leaf-a", Some("leaf-renamed"), None)
        .await
        .unwrap();
    assert_eq!(name, "leaf-renamed");

    let forest = ops.forest("master").await.unwrap();
    assert!(!forest.contains_name("leaf-a"));
    let node = forest.node(forest.find_by_name("leaf-renamed").unwrap());
    assert_eq!(node.description, "leaf-renamed");

    let generated = ops.rename("master", "deep", None, Some("自动命名")).await.unwrap();
    assert!(is_hex_name(&generated));

    let err = ops
        .rename("master", "grand", Some("agent1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NameCollision(_)));

    let err = ops
        .rename("master", "missing", Some("other"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_remove_with_and_without_children() {
    let h = Harness::new(snapshotted());
    let ops = SnapshotOps::new(h.ctx.clone());

    ops.remove("master", "child-b", true).await.unwrap();
    let forest = ops.forest("master").await.unwrap();
    assert!(!forest.contains_name("grand"));
    assert!(!forest.contains_name("deep"));
    assert_eq!(forest.len(), 3);

    ops.remove("master", "base", false).await.unwrap();
    let listing = ops.list("master").await.unwrap();
    assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["child-a"]);
    assert_eq!(listing["child-a"], vec!["leaf-a".to_string()]);

    let err = ops.remove("master", "base", true).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_allocator_skips_taken_names() {
    let h = Harness::new(snapshotted());
    let allocator = NameAllocator::new(h.ctx.clone())
        .with_generator(sequence(&["master", "agent-base", "deep", "fresh"]));

    let lease = allocator.allocate().await.unwrap();
    assert_eq!(lease.name(), "fresh");
    assert!(h.ctx.leases().is_leased("fresh"));

    drop(lease);
    assert!(h.ctx.leases().is_empty());
}

#[tokio::test]
async fn test_allocator_skips_leased_names() {
    let h = Harness::new(inventory());
    let _held = h.ctx.leases().try_acquire("busy").unwrap();
    let allocator =
        NameAllocator::new(h.ctx.clone()).with_generator(sequence(&["busy", "free"]));

    assert_eq!(allocator.allocate().await.unwrap().name(), "free");

    let err = allocator.claim("busy").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NameCollision(_)));
}

#[tokio::test]
async fn test_allocator_bounded_retry() {
    let config = OrchestratorConfig {
        name_retry: NameRetryPolicy {
            max_attempts: Some(3),
        },
        ..Default::default()
    };
    let h = Harness::with_config(inventory(), config);
    let allocator = NameAllocator::new(h.ctx.clone()).with_generator(|| "master".to_string());

    let err = allocator.allocate().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NameCollision(_)));
}

#[tokio::test]
async fn test_claim_rejects_blank_name() {
    let h = Harness::new(inventory());
    let err = NameAllocator::new(h.ctx.clone())
        .claim("  ")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NameCollision(_)));
}
