//! 电源状态前置条件测试

mod common;

use common::*;
use vcm_orchestrator::*;
use vcm_vimclient::{PowerState, Question, VmFixture};

async fn ensure(h: &Harness, name: &str) -> Result<PowerState> {
    let vm = h.vm(name).await;
    StatePrecondition::new(h.ctx.clone())
        .ensure_quiescent(&vm)
        .await
}

#[tokio::test]
async fn test_powered_off_is_returned_unchanged() {
    let h = Harness::new(inventory());

    assert_eq!(ensure(&h, "master").await.unwrap(), PowerState::PoweredOff);
    assert_eq!(h.server.call_count("suspend"), 0);
}

#[tokio::test]
async fn test_suspended_is_returned_unchanged() {
    let h = Harness::new(inventory_with(
        VmFixture::new("master").power_state(PowerState::Suspended),
    ));

    assert_eq!(ensure(&h, "master").await.unwrap(), PowerState::Suspended);
    assert_eq!(h.server.call_count("suspend"), 0);
}

#[tokio::test]
async fn test_running_vm_is_suspended() {
    let h = Harness::new(inventory_with(
        VmFixture::new("master").power_state(PowerState::PoweredOn),
    ));

    assert_eq!(ensure(&h, "master").await.unwrap(), PowerState::Suspended);
    assert_eq!(h.state("master").await, PowerState::Suspended);
    assert_eq!(h.server.call_targets("suspend"), vec!["master".to_string()]);
}

#[tokio::test]
async fn test_suspend_without_effect_is_precondition_error() {
    let h = Harness::new(inventory_with(
        VmFixture::new("master").power_state(PowerState::PoweredOn),
    ));
    h.server.set_suspend_noop(true);

    let err = ensure(&h, "master").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Precondition(_)));
    assert_eq!(h.state("master").await, PowerState::PoweredOn);
}

#[tokio::test]
async fn test_failed_suspend_task_is_precondition_error() {
    let h = Harness::new(inventory_with(
        VmFixture::new("master").power_state(PowerState::PoweredOn),
    ));
    h.server.fail_operation("suspend", "master", "客户机工具未响应");

    let err = ensure(&h, "master").await.unwrap_err();
    match err {
        OrchestratorError::Precondition(msg) => assert!(msg.contains("客户机工具未响应")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(h.state("master").await, PowerState::PoweredOn);
}

#[tokio::test]
async fn test_pending_question_answered_before_suspend() {
    let h = Harness::new(inventory_with(
        VmFixture::new("master")
            .power_state(PowerState::PoweredOn)
            .question(Question::new("q-1", "msg.uuid.moved")),
    ));

    assert_eq!(ensure(&h, "master").await.unwrap(), PowerState::Suspended);
    assert_eq!(
        h.server.call_targets("answer_question"),
        vec!["master:2".to_string()]
    );
    assert_eq!(h.clock.sleeps(), vec![h.ctx.config().question_settle()]);
}

#[tokio::test]
async fn test_unknown_pending_question_is_fatal() {
    let h = Harness::new(inventory_with(
        VmFixture::new("master")
            .power_state(PowerState::PoweredOn)
            .question(Question::new("q-2", "msg.cdrom.locked")),
    ));

    let err = ensure(&h, "master").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InteractiveQuestionUnknown { .. }
    ));
    assert_eq!(h.server.call_count("suspend"), 0);
    assert_eq!(h.server.call_count("answer_question"), 0);
}

#[tokio::test]
async fn test_unreadable_suspend_task_is_precondition_error() {
    let h = Harness::new(inventory_with(
        VmFixture::new("master").power_state(PowerState::PoweredOn),
    ));
    h.server.fail_task_reads(10);

    let err = ensure(&h, "master").await.unwrap_err();
    match err {
        OrchestratorError::Precondition(msg) => assert!(msg.contains("master")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(
        h.server.call_count("task_info"),
        h.ctx.config().max_poll_read_failures as usize
    );
}
