//! Bundled modules.
//!
//! Each is thin glue between the runtime and one platform port:
//!
//! | module         | port               | prio | notes                           |
//! |----------------|--------------------|------|---------------------------------|
//! | `CONTROL_FS`   | `FileStore`        | 100  | critical; config engine, logs   |
//! | `CONTROL_WIFI` | `ConnectivityPort` |  90  | drives the web server edge      |
//! | `CONTROL_LCD`  | `DisplayPort`      |  85  | the only renderer; queue of 16  |
//! | `CONTROL_WEB`  | `WebServerPort`    |  75  | started once WiFi is up         |

pub mod fs;
pub mod lcd;
pub mod web;
pub mod wifi;

pub use fs::FsModule;
pub use lcd::LcdModule;
pub use web::WebModule;
pub use wifi::WifiModule;

use serde_json::Value;

use crate::bus::{Envelope, ModuleQueue};

/// Everything waiting on `queue`, bounded by its capacity so a busy
/// sender cannot pin the draining task.
pub(crate) fn drain(queue: Option<&ModuleQueue>) -> Vec<Envelope> {
    let Some(q) = queue else {
        return Vec::new();
    };
    std::iter::from_fn(|| q.try_receive())
        .take(q.config().length.max(1))
        .collect()
}

/// `params.<key>` as a string, or `params` itself when it is a bare string.
pub(crate) fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .or_else(|| params.as_str())
}
