//! `CONTROL_WEB`: HTTP server lifecycle over a [`WebServerPort`].
//!
//! The manager starts it only while WiFi is up. Queue requests are answered
//! with the server state.

use std::sync::Arc;

use log::{info, warn};
use serde_json::{Map, Value, json};

use crate::bus::{CallKind, RECEIVE_RETURN_CALL_FUNC};
use crate::error::{LifecycleError, RegistryError, Result};
use crate::module::{CONTROL_WEB, Module, ModuleCore};
use crate::ports::WebServerPort;
use crate::registry::Registry;

use super::drain;

pub const DEFAULT_PORT: u16 = 80;

pub struct WebModule {
    core: ModuleCore,
    server: Box<dyn WebServerPort>,
    registry: Arc<Registry>,
    port: u16,
}

impl WebModule {
    pub fn new(server: Box<dyn WebServerPort>, registry: Arc<Registry>) -> Self {
        let mut core = ModuleCore::new(CONTROL_WEB)
            .with_priority(75)
            .with_autostart(true)
            .with_queue(8);
        core.task_cfg.stack_bytes = 8192;
        Self {
            core,
            server,
            registry,
            port: DEFAULT_PORT,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_serving(&self) -> bool {
        self.server.is_running()
    }

    fn server_state(&self) -> Value {
        json!({ "running": self.server.is_running(), "port": self.port })
    }
}

impl Module for WebModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn init(&mut self) -> Result<()> {
        if self.port == 0 {
            warn!("Web: port 0 configured");
            return Err(LifecycleError::InitFailed.into());
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.server.start(self.port)?;
        info!("Web: serving on :{}", self.port);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.server.stop();
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        for env in drain(self.core.queue()) {
            if env.call_name.as_str() == RECEIVE_RETURN_CALL_FUNC || env.call != CallKind::SyncCall {
                continue;
            }
            if let Some(q) = self.core.queue() {
                if let Err(e) = q.respond(&env, self.server_state(), &self.registry) {
                    warn!("Web: reply to '{}' failed: {}", env.from, e);
                }
            }
        }
        Ok(())
    }

    fn status(&self) -> Value {
        self.core.status_with(self.server_state())
    }

    fn load_config(&mut self, global: &Value) -> bool {
        let found = self.core.load_config(global);
        if let Some(p) = global
            .pointer("/web/port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
        {
            self.port = p;
        }
        found
    }

    fn save_config(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("port".into(), json!(self.port));
        extra
    }

    fn call_function_by_name(&mut self, name: &str, _params: &Value) -> core::result::Result<Value, RegistryError> {
        match name {
            "web_status" => Ok(self.server_state()),
            _ => Err(RegistryError::NotFound),
        }
    }
}
