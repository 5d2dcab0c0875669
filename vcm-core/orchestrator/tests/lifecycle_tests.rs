//! 电源、清单与销毁测试

mod common;

use common::*;
use vcm_orchestrator::*;
use vcm_vimclient::{DatastorePath, InMemoryServer, PowerState, Question, StoredFile, VmFixture};

fn fleet() -> InMemoryServer {
    InMemoryServer::builder()
        .datastore("datastore1", 200 * 1024 * 1024 * 1024)
        .vm(VmFixture::new("master").guest_nic("00:50:56:aa:bb:cc", &["10.0.0.5", "fe80::1"]))
        .vm(VmFixture::new("agent1").power_state(PowerState::PoweredOn))
        .vm(VmFixture::new("agent2").power_state(PowerState::Suspended))
        .vm(VmFixture::new("agent3")
            .power_state(PowerState::PoweredOn)
            .question(Question::new("q-1", "msg.uuid.moved")))
        .build()
}

#[tokio::test]
async fn test_power_state_overlay() {
    let h = Harness::new(fleet());
    let power = PowerOps::new(h.ctx.clone());

    assert_eq!(power.state("master").await.unwrap(), PowerState::PoweredOff);
    assert_eq!(power.state("agent1").await.unwrap(), PowerState::PoweredOn);
    assert_eq!(
        power.state("agent3").await.unwrap(),
        PowerState::PendingQuestion
    );
    assert!(matches!(
        power.state("ghost").await.unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let h = Harness::new(fleet());
    let power = PowerOps::new(h.ctx.clone());

    power.start("master").await.unwrap();
    assert_eq!(h.state("master").await, PowerState::PoweredOn);
    power.start("master").await.unwrap();
    assert_eq!(h.server.call_count("power_on"), 1);
}

#[tokio::test]
async fn test_start_answers_pending_question() {
    let h = Harness::new(fleet());
    PowerOps::new(h.ctx.clone()).start("agent3").await.unwrap();

    assert_eq!(
        h.server.call_targets("answer_question"),
        vec!["agent3:2".to_string()]
    );
    assert_eq!(h.server.call_count("power_on"), 0);
}

#[tokio::test]
async fn test_stop_resumes_suspended_vm_first() {
    let h = Harness::new(fleet());
    let power = PowerOps::new(h.ctx.clone());

    power.stop("agent2").await.unwrap();
    assert_eq!(h.state("agent2").await, PowerState::PoweredOff);
    assert_eq!(h.server.call_targets("power_on"), vec!["agent2".to_string()]);
    assert_eq!(h.server.call_targets("power_off"), vec!["agent2".to_string()]);

    power.stop("agent2").await.unwrap();
    assert_eq!(h.server.call_count("power_off"), 1);
}

#[tokio::test]
async fn test_suspend() {
    let h = Harness::new(fleet());
    let power = PowerOps::new(h.ctx.clone());

    power.suspend("agent1").await.unwrap();
    assert_eq!(h.state("agent1").await, PowerState::Suspended);
    power.suspend("agent1").await.unwrap();
    assert_eq!(h.server.call_count("suspend"), 1);

    let err = power.suspend("master").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Precondition(_)));
}

#[tokio::test]
async fn test_reset() {
    let h = Harness::new(fleet());
    let power = PowerOps::new(h.ctx.clone());

    power.reset("agent1").await.unwrap();
    assert_eq!(h.state("agent1").await, PowerState::PoweredOn);

    let err = power.reset("master").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::TaskFailure { .. }));
}

#[tokio::test]
async fn test_inventory_queries() {
    let h = Harness::new(fleet());
    let inventory = InventoryOps::new(h.ctx.clone());

    assert!(inventory.is_registered("master").await.unwrap());
    assert!(!inventory.is_registered("ghost").await.unwrap());
    assert_eq!(
        inventory.list_registered().await.unwrap(),
        vec!["agent1", "agent2", "agent3", "master"]
    );
    assert_eq!(
        inventory.descriptor_path("master").await.unwrap().to_string(),
        "[datastore1] master/master.vmx"
    );

    let space = inventory.datastore_space("master").await.unwrap();
    assert_eq!(space.get("datastore1"), Some(&(200 * 1024 * 1024 * 1024)));

    assert_eq!(
        inventory.mac_address("master").await.unwrap().as_deref(),
        Some("00:50:56:aa:bb:cc")
    );
    assert_eq!(
        inventory.ip_address("master").await.unwrap().as_deref(),
        Some("10.0.0.5")
    );
    assert_eq!(inventory.mac_address("agent1").await.unwrap(), None);
    assert_eq!(inventory.ip_address("agent1").await.unwrap(), None);

    let about = inventory.server_identity().await.unwrap();
    assert_eq!(about.version, "6.7.0");
    assert_eq!(about.hostname.as_deref(), Some("esx-memory.local"));
}

#[tokio::test]
async fn test_destroy_full_vm() {
    let h = Harness::new(fleet());
    let inventory = InventoryOps::new(h.ctx.clone());

    inventory.destroy("agent1").await.unwrap();

    assert!(!inventory.is_registered("agent1").await.unwrap());
    assert_eq!(h.server.call_targets("power_off"), vec!["agent1".to_string()]);
    assert_eq!(h.server.call_count("destroy_vm"), 1);
    assert!(!h
        .server
        .file_exists(&DatastorePath::file("datastore1", "agent1", "agent1.vmx")));
}

#[tokio::test]
async fn test_destroy_quick_clone_keeps_master_disks() {
    let h = Harness::new(fleet());
    CloneOrchestrator::new(h.ctx.clone())
        .quick_clone(&CloneSpec::new("master").with_name("qc"))
        .await
        .unwrap();
    let inventory = InventoryOps::new(h.ctx.clone());
    assert!(inventory.is_quick_clone("qc").await.unwrap());

    inventory.destroy("qc").await.unwrap();

    assert!(!inventory.is_registered("qc").await.unwrap());
    assert_eq!(h.server.call_count("destroy_vm"), 0);
    assert_eq!(h.server.call_count("unregister_vm"), 1);
    assert!(!h
        .server
        .directory_exists(&DatastorePath::directory("datastore1", "qc")));
    assert!(!h
        .server
        .file_exists(&DatastorePath::file("datastore1", "qc", "master.vmx")));
    assert!(h
        .server
        .file_exists(&DatastorePath::file("datastore1", "master", "master.vmdk")));

    // 子项先于目录删除
    let deletes = h.server.call_targets("delete_datastore_file");
    assert_eq!(deletes.last().map(String::as_str), Some("[datastore1] qc"));
}

fn current_disk(server: &InMemoryServer, name: &str) -> Option<DatastorePath> {
    let descriptor = DatastorePath::file("datastore1", name, format!("{}.vmx", name));
    match server.file(&descriptor)? {
        StoredFile::Descriptor(config) => config
            .disks()
            .next()
            .and_then(|disk| disk.disk_backing())
            .and_then(|backing| backing.flat_file().cloned()),
        _ => None,
    }
}

#[tokio::test]
async fn test_quick_clone_detected_through_snapshot_backing() {
    let h = Harness::new(fleet());
    h.server.set_delta_disks_on_snapshot(true);
    CloneOrchestrator::new(h.ctx.clone())
        .quick_clone(&CloneSpec::new("master").with_name("qc").with_power_on(false))
        .await
        .unwrap();

    // 基线快照之后当前磁盘是自身目录中的差分文件
    assert_eq!(
        current_disk(&h.server, "qc"),
        Some(DatastorePath::file("datastore1", "qc", "master-000001.vmdk"))
    );

    let inventory = InventoryOps::new(h.ctx.clone());
    assert!(inventory.is_quick_clone("qc").await.unwrap());

    inventory.destroy("qc").await.unwrap();
    assert_eq!(h.server.call_count("destroy_vm"), 0);
    assert!(!h
        .server
        .file_exists(&DatastorePath::file("datastore1", "qc", "master-000001.vmdk")));
    assert!(h
        .server
        .file_exists(&DatastorePath::file("datastore1", "master", "master.vmdk")));
}

#[tokio::test]
async fn test_snapshotted_full_vm_is_not_quick_clone() {
    let h = Harness::new(fleet());
    h.server.set_delta_disks_on_snapshot(true);
    SnapshotOps::new(h.ctx.clone())
        .create("master", Some("before-update"), None, false)
        .await
        .unwrap();

    assert_eq!(
        current_disk(&h.server, "master"),
        Some(DatastorePath::file("datastore1", "master", "master-000001.vmdk"))
    );
    let inventory = InventoryOps::new(h.ctx.clone());
    assert!(!inventory.is_quick_clone("master").await.unwrap());

    inventory.destroy("master").await.unwrap();
    assert_eq!(h.server.call_count("destroy_vm"), 1);
}
