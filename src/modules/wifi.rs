//! `CONTROL_WIFI`: station link over a [`ConnectivityPort`].
//!
//! Credentials come from the global `wifi` section. `update()` polls the
//! port, which owns the reconnect backoff. The manager watches
//! `isConnected` in `status()` to bring the web server up and down.

use log::{info, warn};
use serde_json::{Value, json};

use crate::error::{RegistryError, Result};
use crate::module::{CONTROL_WIFI, Module, ModuleCore};
use crate::ports::{ConnectivityError, ConnectivityPort};
use crate::task::Core;

use super::str_param;

pub struct WifiModule {
    core: ModuleCore,
    port: Box<dyn ConnectivityPort>,
    credentials: Option<(String, String)>,
}

impl WifiModule {
    pub fn new(port: Box<dyn ConnectivityPort>) -> Self {
        Self {
            core: ModuleCore::new(CONTROL_WIFI)
                .with_priority(90)
                .with_autostart(true)
                .pinned_to(Core::Pro),
            port,
            credentials: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_connected()
    }

    fn apply_credentials(&mut self) -> core::result::Result<(), ConnectivityError> {
        let Some((ssid, password)) = &self.credentials else {
            return Ok(());
        };
        self.port.set_credentials(ssid, password)
    }

    fn connect(&mut self) {
        match self.port.connect() {
            Ok(()) | Err(ConnectivityError::AlreadyConnected) => {}
            Err(ConnectivityError::NoCredentials) => info!("WiFi: no credentials, staying offline"),
            // The port schedules its own retry.
            Err(e) => warn!("WiFi: connect failed: {}", e),
        }
    }
}

impl Module for WifiModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn init(&mut self) -> Result<()> {
        if let Err(e) = self.apply_credentials() {
            warn!("WiFi: configured credentials rejected: {}", e);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.connect();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.port.disconnect();
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.port.poll();
        Ok(())
    }

    fn status(&self) -> Value {
        self.core.status_with(json!({
            "isConnected": self.port.is_connected(),
            "ssid": self.port.ssid(),
            "rssi": self.port.rssi(),
        }))
    }

    fn load_config(&mut self, global: &Value) -> bool {
        let found = self.core.load_config(global);
        let wifi = global.get("wifi");
        let ssid = wifi.and_then(|w| w.get("ssid")).and_then(Value::as_str).unwrap_or("");
        if !ssid.is_empty() {
            let password = wifi
                .and_then(|w| w.get("password"))
                .and_then(Value::as_str)
                .unwrap_or("");
            self.credentials = Some((ssid.to_string(), password.to_string()));
        }
        found
    }

    fn call_function_by_name(&mut self, name: &str, params: &Value) -> core::result::Result<Value, RegistryError> {
        match name {
            "wifi_status" => Ok(self.status()),
            "wifi_connect" => {
                let ssid = str_param(params, "ssid").ok_or(RegistryError::CallFailed)?;
                let password = params.get("password").and_then(Value::as_str).unwrap_or("");
                self.port.set_credentials(ssid, password).map_err(|e| {
                    warn!("WiFi: credentials rejected: {}", e);
                    RegistryError::CallFailed
                })?;
                self.credentials = Some((ssid.to_string(), password.to_string()));
                self.port.disconnect();
                self.connect();
                Ok(json!(self.port.is_connected()))
            }
            "wifi_disconnect" => {
                self.port.disconnect();
                Ok(Value::Null)
            }
            _ => Err(RegistryError::NotFound),
        }
    }
}
