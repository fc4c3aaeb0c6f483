//! HTTP server adapter for the `CONTROL_WEB` module.
//!
//! On ESP-IDF this owns an `EspHttpServer`; dropping it stops the server.
//! Only a liveness route is registered here; the web UI handlers are
//! attached by the application on top of the same server.
//! The host build keeps a running flag so lifecycle edges are observable.

use log::info;

#[cfg(target_os = "espidf")]
use esp_idf_svc::http::Method;
#[cfg(target_os = "espidf")]
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
#[cfg(target_os = "espidf")]
use esp_idf_svc::io::Write;

use crate::error::{Error, LifecycleError};
use crate::ports::WebServerPort;

#[derive(Default)]
pub struct HttpServer {
    #[cfg(target_os = "espidf")]
    server: Option<EspHttpServer<'static>>,
    #[cfg(not(target_os = "espidf"))]
    running: bool,
}

impl HttpServer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WebServerPort for HttpServer {
    #[cfg(target_os = "espidf")]
    fn start(&mut self, port: u16) -> Result<(), Error> {
        if self.server.is_some() {
            return Ok(());
        }
        let config = Configuration {
            http_port: port,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&config).map_err(|e| {
            log::error!("HTTP: server start failed: {}", e);
            Error::from(LifecycleError::StartFailed)
        })?;
        server
            .fn_handler("/health", Method::Get, |req| {
                req.into_ok_response()?.write_all(b"ok")?;
                Ok::<(), anyhow::Error>(())
            })
            .map_err(|_| Error::from(LifecycleError::StartFailed))?;
        self.server = Some(server);
        info!("HTTP: listening on :{}", port);
        Ok(())
    }

    #[cfg(not(target_os = "espidf"))]
    fn start(&mut self, port: u16) -> Result<(), Error> {
        if port == 0 {
            return Err(LifecycleError::StartFailed.into());
        }
        self.running = true;
        info!("HTTP(sim): listening on :{}", port);
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn stop(&mut self) {
        if self.server.take().is_some() {
            info!("HTTP: stopped");
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn stop(&mut self) {
        if self.running {
            info!("HTTP(sim): stopped");
        }
        self.running = false;
    }

    #[cfg(target_os = "espidf")]
    fn is_running(&self) -> bool {
        self.server.is_some()
    }

    #[cfg(not(target_os = "espidf"))]
    fn is_running(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_toggles_running() {
        let mut http = HttpServer::new();
        assert!(!http.is_running());
        http.start(80).unwrap();
        assert!(http.is_running());
        http.stop();
        assert!(!http.is_running());
        assert!(http.start(0).is_err());
    }
}
