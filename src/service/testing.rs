//! In-process stand-in for a core service

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::common::{ClientTraffic, Error, Result, Traffic};
use crate::model::CoreType;

use super::adapter::CoreService;

pub(crate) struct FakeCore {
    pub(crate) core: CoreType,
    pub(crate) running: AtomicBool,
    pub(crate) crashed: AtomicBool,
    pub(crate) need_restart: AtomicBool,
    pub(crate) restarts: AtomicUsize,
    /// `None` makes `get_traffic` fail
    pub(crate) traffic: Mutex<Option<(Vec<Traffic>, Vec<ClientTraffic>)>>,
    pub(crate) removed: Mutex<Vec<(String, String)>>,
    pub(crate) fail_remove: AtomicBool,
}

impl FakeCore {
    pub(crate) fn new(core: CoreType) -> Self {
        FakeCore {
            core,
            running: AtomicBool::new(true),
            crashed: AtomicBool::new(false),
            need_restart: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
            traffic: Mutex::new(None),
            removed: Mutex::new(Vec::new()),
            fail_remove: AtomicBool::new(false),
        }
    }

    pub(crate) fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoreService for FakeCore {
    fn core(&self) -> CoreType {
        self.core
    }

    async fn get_config(&self) -> Result<Value> {
        Ok(Value::Object(Default::default()))
    }

    async fn restart(&self, _force: bool) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn did_crash(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    async fn get_traffic(&self, _reset: bool) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        self.traffic
            .lock()
            .take()
            .ok_or_else(|| Error::api("connection refused"))
    }

    async fn get_version(&self) -> String {
        "1.0.0".to_string()
    }

    fn get_uptime(&self) -> u64 {
        0
    }

    fn get_result(&self) -> String {
        String::new()
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_config_file(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("config.json"))
    }

    async fn add_user(&self, _protocol: &str, _tag: &str, _client: &Value) -> Result<()> {
        Ok(())
    }

    async fn remove_user(&self, tag: &str, email: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Error::api("user not found"));
        }
        self.removed.lock().push((tag.to_string(), email.to_string()));
        Ok(())
    }

    fn set_need_restart(&self) {
        self.need_restart.store(true, Ordering::SeqCst);
    }

    fn is_need_restart_and_set_false(&self) -> bool {
        self.need_restart.swap(false, Ordering::SeqCst)
    }
}
