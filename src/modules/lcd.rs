//! `CONTROL_LCD`: the only module that draws.
//!
//! Everything else reaches the panel through its queue:
//!
//! - `lcd_boot_step` `{op, percent}`: progress bar, percent clamped to 0..100
//! - `lcd_log_append` `{v: [line, ...]}`: scrolling tail of the last 5 lines
//! - `lcd_brightness` `{level}`: backlight; a `SyncCall` gets the applied
//!   level back as `RESULT`
//!
//! Any other `SyncCall` is echoed back through `RECEIVE_RETURN_CALL_FUNC`.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{Map, Value, json};

use crate::bus::{CallKind, Envelope, LCD_BOOT_STEP, LCD_LOG_APPEND, RECEIVE_RETURN_CALL_FUNC};
use crate::error::{RegistryError, Result};
use crate::module::{CONTROL_LCD, Module, ModuleCore};
use crate::ports::DisplayPort;
use crate::registry::Registry;
use crate::task::Core;

use super::drain;

pub const LCD_BRIGHTNESS: &str = "lcd_brightness";
pub const LOG_LINES: usize = 5;
pub const QUEUE_LENGTH: usize = 16;

pub struct LcdModule {
    core: ModuleCore,
    display: Box<dyn DisplayPort>,
    registry: Arc<Registry>,
    lines: VecDeque<String>,
    last_step: Option<(String, u8)>,
    brightness: u8,
    handled: u64,
}

impl LcdModule {
    pub fn new(display: Box<dyn DisplayPort>, registry: Arc<Registry>) -> Self {
        Self {
            core: ModuleCore::new(CONTROL_LCD)
                .with_priority(85)
                .with_autostart(true)
                .with_queue(QUEUE_LENGTH)
                .pinned_to(Core::App),
            display,
            registry,
            lines: VecDeque::with_capacity(LOG_LINES),
            last_step: None,
            brightness: u8::MAX,
            handled: 0,
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last_step(&self) -> Option<(&str, u8)> {
        self.last_step.as_ref().map(|(op, p)| (op.as_str(), *p))
    }

    /// Handle everything currently queued. Returns the count.
    pub fn process_queue(&mut self) -> usize {
        let pending = drain(self.core.queue());
        let n = pending.len();
        for env in pending {
            self.handle(&env);
        }
        n
    }

    fn handle(&mut self, env: &Envelope) {
        self.handled += 1;
        match env.call_name.as_str() {
            LCD_BOOT_STEP => {
                let op = env.vars.get("op").and_then(Value::as_str).unwrap_or("");
                let percent = env
                    .vars
                    .get("percent")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    .clamp(0, 100) as u8;
                self.display.draw_boot_step(op, percent);
                self.last_step = Some((op.to_string(), percent));
            }
            LCD_LOG_APPEND => {
                self.append_lines(&env.vars);
                let view: Vec<&str> = self.lines.iter().map(String::as_str).collect();
                self.display.draw_log(&view);
            }
            LCD_BRIGHTNESS => {
                let level = env
                    .vars
                    .get("level")
                    .or_else(|| env.tagged(0))
                    .and_then(Value::as_u64)
                    .unwrap_or(u64::from(u8::MAX))
                    .min(u64::from(u8::MAX)) as u8;
                self.brightness = level;
                self.display.set_brightness(level);
                if env.call == CallKind::SyncCall {
                    self.reply(env, json!(level));
                }
            }
            RECEIVE_RETURN_CALL_FUNC => debug!("LCD: reply from '{}' ignored", env.from),
            other if env.call == CallKind::SyncCall => {
                debug!("LCD: echoing '{}' to '{}'", other, env.from);
                if let Some(q) = self.core.queue() {
                    if let Err(e) = q.reply_return_call(env, &self.registry) {
                        warn!("LCD: reply to '{}' failed: {}", env.from, e);
                    }
                }
            }
            other => debug!("LCD: unhandled '{}' from '{}'", other, env.from),
        }
    }

    fn append_lines(&mut self, vars: &Value) {
        let incoming: Vec<&str> = match vars.get("v") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(s)) => vec![s.as_str()],
            _ => Vec::new(),
        };
        for line in incoming {
            if self.lines.len() == LOG_LINES {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }
    }

    fn reply(&self, env: &Envelope, payload: Value) {
        let Some(q) = self.core.queue() else {
            return;
        };
        if let Err(e) = q.respond(env, payload, &self.registry) {
            warn!("LCD: reply to '{}' failed: {}", env.from, e);
        }
    }
}

impl Module for LcdModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn init(&mut self) -> Result<()> {
        self.display.clear();
        self.display.set_brightness(self.brightness);
        info!("LCD: display ready");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.process_queue();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.display.clear();
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.process_queue();
        Ok(())
    }

    fn status(&self) -> Value {
        self.core.status_with(json!({
            "brightness": self.brightness,
            "lines": self.lines,
            "last_step": self.last_step.as_ref().map(|(op, p)| json!({ "op": op, "percent": p })),
            "handled": self.handled,
        }))
    }

    fn load_config(&mut self, global: &Value) -> bool {
        let found = self.core.load_config(global);
        if let Some(b) = self.core.config().get("brightness").and_then(Value::as_u64) {
            self.brightness = b.min(u64::from(u8::MAX)) as u8;
        }
        found
    }

    fn save_config(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("brightness".into(), json!(self.brightness));
        extra
    }

    fn call_function_by_name(&mut self, name: &str, params: &Value) -> core::result::Result<Value, RegistryError> {
        match name {
            "lcd_clear" => {
                self.lines.clear();
                self.display.clear();
                Ok(Value::Null)
            }
            "lcd_print" => {
                self.append_lines(&json!({ "v": params.clone() }));
                let view: Vec<&str> = self.lines.iter().map(String::as_str).collect();
                self.display.draw_log(&view);
                Ok(json!(self.lines.len()))
            }
            _ => Err(RegistryError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bus::{ModuleQueue, QueueConfig, boot_step_vars, log_append_vars, result_payload};
    use crate::module::MAIN_CONTEXT;

    #[derive(Default)]
    struct Recorded {
        steps: Vec<(String, u8)>,
        logs: Vec<Vec<String>>,
        brightness: Vec<u8>,
    }

    struct MockDisplay(Arc<Mutex<Recorded>>);

    impl DisplayPort for MockDisplay {
        fn draw_boot_step(&mut self, op: &str, percent: u8) {
            self.0.lock().unwrap().steps.push((op.to_string(), percent));
        }
        fn draw_log(&mut self, lines: &[&str]) {
            self.0.lock().unwrap().logs.push(lines.iter().map(|l| l.to_string()).collect());
        }
        fn set_brightness(&mut self, level: u8) {
            self.0.lock().unwrap().brightness.push(level);
        }
        fn clear(&mut self) {}
    }

    fn lcd() -> (LcdModule, Arc<Mutex<Recorded>>, Arc<Registry>) {
        let rec = Arc::new(Mutex::new(Recorded::default()));
        let registry = Arc::new(Registry::new());
        let mut m = LcdModule::new(Box::new(MockDisplay(rec.clone())), registry.clone());
        let q = ModuleQueue::new(CONTROL_LCD, m.core.queue_cfg);
        registry.register_queue(CONTROL_LCD, q.handle().clone());
        m.core.attach_queue(q);
        (m, rec, registry)
    }

    fn send(registry: &Registry, env: Envelope) {
        registry.find_queue(CONTROL_LCD).unwrap().try_send(env).unwrap();
    }

    #[test]
    fn boot_steps_are_drawn_and_clamped() {
        let (mut m, rec, registry) = lcd();
        send(&registry, Envelope::notify(MAIN_CONTEXT, CONTROL_LCD, LCD_BOOT_STEP, boot_step_vars("Init FS", 40)));
        send(
            &registry,
            Envelope::notify(MAIN_CONTEXT, CONTROL_LCD, LCD_BOOT_STEP, json!({ "op": "x", "percent": 250 })),
        );
        assert_eq!(m.process_queue(), 2);
        let rec = rec.lock().unwrap();
        assert_eq!(rec.steps, [("Init FS".to_string(), 40), ("x".to_string(), 100)]);
        assert_eq!(m.last_step(), Some(("x", 100)));
    }

    #[test]
    fn log_tail_keeps_last_five() {
        let (mut m, rec, registry) = lcd();
        let lines: Vec<String> = (0..7).map(|i| format!("line {i}")).collect();
        send(&registry, Envelope::notify(MAIN_CONTEXT, CONTROL_LCD, LCD_LOG_APPEND, log_append_vars(&lines)));
        m.process_queue();
        assert_eq!(m.lines().collect::<Vec<_>>(), ["line 2", "line 3", "line 4", "line 5", "line 6"]);
        assert_eq!(rec.lock().unwrap().logs.last().map(Vec::len), Some(LOG_LINES));
    }

    #[test]
    fn brightness_sync_call_replies() {
        let (mut m, rec, registry) = lcd();
        let requester = ModuleQueue::new("CONTROL_WEB", QueueConfig::default());
        registry.register_queue("CONTROL_WEB", requester.handle().clone());

        send(
            &registry,
            Envelope::request("CONTROL_WEB", CONTROL_LCD, CallKind::SyncCall, LCD_BRIGHTNESS, json!({ "level": 300 })),
        );
        m.process_queue();

        assert_eq!(rec.lock().unwrap().brightness.last(), Some(&255));
        let reply = requester.try_receive().unwrap();
        assert_eq!(reply.from, CONTROL_LCD);
        assert_eq!(result_payload(&reply), Some(&json!(255)));
    }

    #[test]
    fn unknown_sync_call_is_echoed() {
        let (mut m, _rec, registry) = lcd();
        let requester = ModuleQueue::new("S", QueueConfig::default());
        registry.register_queue("S", requester.handle().clone());

        send(&registry, Envelope::request("S", CONTROL_LCD, CallKind::SyncCall, "ping", json!({ "v": 42 })));
        m.process_queue();
        let reply = requester.try_receive().unwrap();
        assert_eq!(reply.call_name.as_str(), RECEIVE_RETURN_CALL_FUNC);
        assert_eq!(result_payload(&reply), Some(&json!(42)));
    }

    #[test]
    fn brightness_round_trips_through_config() {
        let (mut m, _rec, _registry) = lcd();
        let doc = json!({ "modules": { CONTROL_LCD: { "brightness": 40 } } });
        assert!(m.load_config(&doc));
        assert_eq!(m.save_config()["brightness"], 40);
    }
}
