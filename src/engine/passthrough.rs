//! A minimal engine used when no real rules engine is linked in.
//!
//! It inspects nothing and blocks nothing; its configuration file only
//! carries the context switches the mediation layer reads (blocking
//! mode, per-direction buffering). Production deployments replace the
//! manager's factory with a binding to an actual rules engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::{WafError, WafResult};

use super::server::TransactionServer;
use super::{
    ConfigValue, ConnHandle, ConnInfo, ContextKey, Direction, EngineFlags, HeaderField,
    LimitAction, RulesEngine, TxHandle,
};

pub struct PassthroughEngine {
    flags: EngineFlags,
    context: HashMap<ContextKey, ConfigValue>,
    next_handle: AtomicU64,
}

impl PassthroughEngine {
    /// Loads the engine from its configuration file: one directive per
    /// line, `#` comments, unknown directives rejected.
    pub fn load(config_path: &Path) -> WafResult<Arc<dyn RulesEngine>> {
        let raw = std::fs::read_to_string(config_path).map_err(|e| {
            WafError::Config(format!("engine config {}: {e}", config_path.display()))
        })?;

        let mut flags = EngineFlags::empty();
        let mut context = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut words = line.split_ascii_whitespace();
            let directive = words.next().unwrap_or_default();
            let value = words.next().unwrap_or("on");
            match directive {
                "blocking" => {
                    flags.set(EngineFlags::BLOCKING, on_off(value, lineno)?);
                }
                "inspect_request_body" => {
                    flags.set(EngineFlags::INSPECT_REQUEST_BODY, on_off(value, lineno)?);
                }
                "inspect_response_body" => {
                    flags.set(EngineFlags::INSPECT_RESPONSE_BODY, on_off(value, lineno)?);
                }
                "buffer_request_body" => {
                    context.insert(
                        ContextKey::BufferBody(Direction::Request),
                        ConfigValue::Bool(on_off(value, lineno)?),
                    );
                }
                "buffer_response_body" => {
                    context.insert(
                        ContextKey::BufferBody(Direction::Response),
                        ConfigValue::Bool(on_off(value, lineno)?),
                    );
                }
                "request_buffer_limit" | "response_buffer_limit" => {
                    let dir = if directive.starts_with("request") {
                        Direction::Request
                    } else {
                        Direction::Response
                    };
                    let limit: u64 = value.parse().map_err(|_| {
                        WafError::Config(format!("line {}: bad limit {value:?}", lineno + 1))
                    })?;
                    context.insert(ContextKey::BufferLimit(dir), ConfigValue::Uint(limit));
                }
                "request_limit_action" | "response_limit_action" => {
                    let dir = if directive.starts_with("request") {
                        Direction::Request
                    } else {
                        Direction::Response
                    };
                    let action = match value {
                        "flush-all" => LimitAction::FlushAll,
                        "flush-partial" => LimitAction::FlushPartial,
                        other => {
                            return Err(WafError::Config(format!(
                                "line {}: unknown limit action {other:?}",
                                lineno + 1
                            )))
                        }
                    };
                    context.insert(
                        ContextKey::BufferLimitAction(dir),
                        ConfigValue::Action(action),
                    );
                }
                other => {
                    return Err(WafError::Config(format!(
                        "line {}: unknown directive {other:?}",
                        lineno + 1
                    )))
                }
            }
        }

        Ok(Arc::new(Self {
            flags,
            context,
            next_handle: AtomicU64::new(1),
        }))
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

fn on_off(value: &str, lineno: usize) -> WafResult<bool> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(WafError::Config(format!(
            "line {}: expected on/off, got {other:?}",
            lineno + 1
        ))),
    }
}

impl RulesEngine for PassthroughEngine {
    fn conn_create(&self, info: &ConnInfo) -> WafResult<ConnHandle> {
        log::debug!("passthrough: connection from {}:{}", info.client_ip, info.client_port);
        Ok(ConnHandle(self.handle()))
    }

    fn conn_opened(&self, _conn: ConnHandle) -> WafResult<()> {
        Ok(())
    }

    fn conn_closed(&self, _conn: ConnHandle) -> WafResult<()> {
        Ok(())
    }

    fn conn_destroy(&self, _conn: ConnHandle) {}

    fn tx_create(
        &self,
        _conn: ConnHandle,
        _server: Arc<dyn TransactionServer>,
    ) -> WafResult<TxHandle> {
        Ok(TxHandle(self.handle()))
    }

    fn tx_destroy(&self, _tx: TxHandle) {}

    fn request_started(&self, tx: TxHandle, line: &[u8]) -> WafResult<()> {
        log::debug!("passthrough[{}]: {}", tx.0, String::from_utf8_lossy(line));
        Ok(())
    }

    fn request_header_data(&self, _tx: TxHandle, _headers: &[HeaderField]) -> WafResult<()> {
        Ok(())
    }

    fn request_header_finished(&self, _tx: TxHandle) -> WafResult<()> {
        Ok(())
    }

    fn request_body_data(&self, _tx: TxHandle, _data: &[u8]) -> WafResult<()> {
        Ok(())
    }

    fn request_finished(&self, _tx: TxHandle) -> WafResult<()> {
        Ok(())
    }

    fn response_started(&self, _tx: TxHandle, _line: &[u8]) -> WafResult<()> {
        Ok(())
    }

    fn response_header_data(&self, _tx: TxHandle, _headers: &[HeaderField]) -> WafResult<()> {
        Ok(())
    }

    fn response_header_finished(&self, _tx: TxHandle) -> WafResult<()> {
        Ok(())
    }

    fn response_body_data(&self, _tx: TxHandle, _data: &[u8]) -> WafResult<()> {
        Ok(())
    }

    fn response_finished(&self, _tx: TxHandle) -> WafResult<()> {
        Ok(())
    }

    fn postprocess(&self, _tx: TxHandle) -> WafResult<()> {
        Ok(())
    }

    fn logging(&self, _tx: TxHandle) -> WafResult<()> {
        Ok(())
    }

    fn tx_flags(&self, _tx: TxHandle) -> EngineFlags {
        self.flags
    }

    fn context_get(&self, _tx: TxHandle, key: ContextKey) -> Option<ConfigValue> {
        self.context.get(&key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn config_directives_populate_flags_and_context() {
        let file = write_config(
            "# comment\nblocking on\nbuffer_response_body on\nresponse_buffer_limit 1024\nresponse_limit_action flush-partial\n",
        );
        let engine = PassthroughEngine::load(file.path()).unwrap();
        let flags = engine.tx_flags(TxHandle(1));
        assert!(flags.contains(EngineFlags::BLOCKING));
        assert_eq!(
            engine.context_get(TxHandle(1), ContextKey::BufferLimit(Direction::Response)),
            Some(ConfigValue::Uint(1024))
        );
        assert_eq!(
            engine.context_get(
                TxHandle(1),
                ContextKey::BufferLimitAction(Direction::Response)
            ),
            Some(ConfigValue::Action(LimitAction::FlushPartial))
        );
    }

    #[test]
    fn unknown_directives_fail_the_load() {
        let file = write_config("observe everything\n");
        assert!(PassthroughEngine::load(file.path()).is_err());
    }

    #[test]
    fn missing_config_fails_the_load() {
        assert!(PassthroughEngine::load(Path::new("/nonexistent/rules.conf")).is_err());
    }
}
