//! 编排引擎测试公共夹具

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vcm_orchestrator::{Clock, Context, OrchestratorConfig};
use vcm_vimclient::{InMemoryServer, ManagementServer, PowerState, VmFixture, VmRef};

/// 只记录等待时长、立即返回的时钟
#[derive(Debug, Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// 测试环境
pub struct Harness {
    pub server: Arc<InMemoryServer>,
    pub clock: Arc<RecordingClock>,
    pub ctx: Context,
}

impl Harness {
    pub fn new(server: InMemoryServer) -> Self {
        Self::with_config(server, OrchestratorConfig::default())
    }

    pub fn with_config(server: InMemoryServer, config: OrchestratorConfig) -> Self {
        let server = Arc::new(server);
        let clock = Arc::new(RecordingClock::default());
        let ctx = Context::new(server.clone(), config).with_clock(clock.clone());
        Self { server, clock, ctx }
    }

    pub async fn vm(&self, name: &str) -> VmRef {
        self.server.find_vm_by_name(name).await.unwrap().unwrap()
    }

    pub async fn state(&self, name: &str) -> PowerState {
        let vm = self.vm(name).await;
        self.server.runtime(&vm).await.unwrap().power_state
    }
}

/// 清单中已有 "master" 与 "agent1" 两台关机的虚拟机
pub fn inventory() -> InMemoryServer {
    InMemoryServer::builder()
        .datastore("datastore1", 200 * 1024 * 1024 * 1024)
        .vm(VmFixture::new("master"))
        .vm(VmFixture::new("agent1"))
        .build()
}

pub fn inventory_with(master: VmFixture) -> InMemoryServer {
    InMemoryServer::builder()
        .datastore("datastore1", 200 * 1024 * 1024 * 1024)
        .vm(master)
        .vm(VmFixture::new("agent1"))
        .build()
}

pub fn is_hex_name(name: &str) -> bool {
    name.len() == 32 && name.chars().all(|c| c.is_ascii_hexdigit())
}
