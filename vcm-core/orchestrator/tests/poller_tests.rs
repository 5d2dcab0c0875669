//! 任务轮询与问题应答测试

mod common;

use common::*;
use vcm_orchestrator::*;
use vcm_vimclient::{ManagementServer, PowerState, Question, VmFixture, VmRef};

#[tokio::test]
async fn test_success_within_k_reads() {
    for k in 1..=4u32 {
        let h = Harness::new(inventory());
        h.server.set_task_running_polls(k - 1);
        let master = h.vm("master").await;

        let task = h.server.power_on(&master).await.unwrap();
        let outcome = TaskPoller::new(h.ctx.clone())
            .wait(&task, None)
            .await
            .unwrap();

        assert_eq!(outcome, TaskOutcome::Success);
        assert!(h.server.call_count("task_info") <= k as usize);
        assert_eq!(h.clock.count(), (k - 1) as usize);
    }
}

#[tokio::test]
async fn test_every_read_failing_gives_up_after_three() {
    let h = Harness::new(inventory());
    let master = h.vm("master").await;
    let task = h.server.power_on(&master).await.unwrap();
    h.server.fail_task_reads(10);

    let err = TaskPoller::new(h.ctx.clone())
        .wait(&task, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::TransientPollError { attempts: 3, .. }
    ));
    assert_eq!(h.server.call_count("task_info"), 3);
}

#[tokio::test]
async fn test_read_failures_below_limit_recover() {
    let h = Harness::new(inventory());
    let master = h.vm("master").await;
    let task = h.server.power_on(&master).await.unwrap();
    h.server.fail_task_reads(2);

    let outcome = TaskPoller::new(h.ctx.clone())
        .wait(&task, None)
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(h.server.call_count("task_info"), 3);
    // 读取失败立即重试，不等待
    assert_eq!(h.clock.count(), 0);
}

#[tokio::test]
async fn test_read_failure_limit_is_configurable() {
    let config = OrchestratorConfig {
        max_poll_read_failures: 5,
        ..Default::default()
    };
    let h = Harness::with_config(inventory(), config);
    let master = h.vm("master").await;
    let task = h.server.power_on(&master).await.unwrap();
    h.server.fail_task_reads(10);

    let err = TaskPoller::new(h.ctx.clone())
        .wait(&task, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::TransientPollError { attempts: 5, .. }
    ));
    assert_eq!(h.server.call_count("task_info"), 5);
}

#[tokio::test]
async fn test_task_error_is_failure_outcome() {
    let h = Harness::new(inventory());
    h.server.fail_operation("power_on", "master", "主机资源不足");
    let master = h.vm("master").await;
    let poller = TaskPoller::new(h.ctx.clone());

    let task = h.server.power_on(&master).await.unwrap();
    assert_eq!(
        poller.wait(&task, None).await.unwrap(),
        TaskOutcome::Failure("主机资源不足".to_string())
    );

    let task = h.server.power_on(&master).await.unwrap();
    let err = poller
        .wait_success(&task, Some(&master), "开机 master")
        .await
        .unwrap_err();
    match err {
        OrchestratorError::TaskFailure { operation, reason } => {
            assert_eq!(operation, "开机 master");
            assert_eq!(reason, "主机资源不足");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(h.state("master").await, PowerState::PoweredOff);
}

#[tokio::test]
async fn test_question_answered_while_polling() {
    let h = Harness::new(inventory());
    h.server
        .raise_question_on_power_on("master", Question::new("q-7", "msg.disk.adapterMismatch"));
    let master = h.vm("master").await;

    let task = h.server.power_on(&master).await.unwrap();
    let outcome = TaskPoller::new(h.ctx.clone())
        .wait(&task, Some(&master))
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(
        h.server.call_targets("answer_question"),
        vec!["master:0".to_string()]
    );
    assert_eq!(
        h.clock.sleeps(),
        vec![h.ctx.config().poll_interval(), h.ctx.config().question_settle()]
    );
}

#[tokio::test]
async fn test_question_code_taken_from_text() {
    let h = Harness::new(inventory());
    h.server.raise_question_on_power_on(
        "master",
        Question::new("q-8", "").with_text("msg.uuid.moved:The virtual machine may have been moved."),
    );
    let master = h.vm("master").await;

    let task = h.server.power_on(&master).await.unwrap();
    TaskPoller::new(h.ctx.clone())
        .wait_success(&task, Some(&master), "开机 master")
        .await
        .unwrap();

    assert_eq!(
        h.server.call_targets("answer_question"),
        vec!["master:2".to_string()]
    );
}

#[tokio::test]
async fn test_runtime_read_failure_does_not_abort_polling() {
    let h = Harness::new(inventory());
    h.server.set_task_running_polls(2);
    let master = h.vm("master").await;
    let ghost = VmRef::new("vm-404", "ghost");

    let task = h.server.power_on(&master).await.unwrap();
    let outcome = TaskPoller::new(h.ctx.clone())
        .wait(&task, Some(&ghost))
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(h.server.call_count("runtime"), 2);
}

#[tokio::test]
async fn test_responder_without_question() {
    let h = Harness::new(inventory_with(
        VmFixture::new("master").question(Question::new("q-1", "msg.uuid.moved")),
    ));
    let responder = QuestionResponder::new(h.ctx.clone());
    let master = h.vm("master").await;
    let agent = h.vm("agent1").await;

    assert!(responder.answer(&master).await.unwrap());
    assert!(!responder.answer(&master).await.unwrap());
    assert!(!responder.answer(&agent).await.unwrap());
    assert_eq!(h.server.call_count("answer_question"), 1);
}
