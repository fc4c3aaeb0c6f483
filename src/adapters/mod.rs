//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter    | Implements         | Connects to                      |
//! |------------|--------------------|----------------------------------|
//! | `display`  | DisplayPort        | Console (panel stand-in)         |
//! | `http`     | WebServerPort      | `EspHttpServer`                  |
//! | `log_sink` | `log::Log`         | Console + `/logs/*.log` via FS   |
//! | `storage`  | FileStore          | SPIFFS through VFS / in-memory   |
//! | `system`   | ResetPort          | Heap counters, `esp_restart`     |
//! | `time`     | (none)             | ESP32 system timer               |
//! | `wifi`     | ConnectivityPort   | ESP-IDF WiFi STA                 |

pub mod display;
pub mod http;
pub mod log_sink;
pub mod storage;
pub mod system;
pub mod time;
pub mod wifi;
