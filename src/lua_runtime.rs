//! Capability-scoped Lua 5.4 VM for rule scripts.
//!
//! Every rule invocation gets its own freshly constructed VM, so no global,
//! upvalue, or monkey-patched library can leak between rules or messages.
//! The VM runs on a blocking thread (via [`tokio::task::spawn_blocking`])
//! from [`crate::rules`].
//!
//! # Exposed primitives
//!
//! | Module | Contents |
//! |--------|----------|
//! | base | `pairs`, `ipairs`, `type`, `tostring`, `tonumber`, `select`, `error`, `pcall`, ... |
//! | `string` | standard library minus `string.dump` |
//! | `table`, `math`, `utf8` | standard libraries |
//! | `log` | `info`, `warn`, `debug` (forwarded to `tracing`) |
//!
//! # Sandboxing
//!
//! `io`, `os`, `debug`, `package` and `coroutine` are never loaded.
//! `load`, `loadfile`, `dofile`, `require`, `collectgarbage` and
//! `string.dump` are removed from the globals. A wall-clock deadline is
//! enforced by an instruction-count hook and a heap ceiling by the
//! allocator limit.

use mlua::prelude::*;
use mlua::{LuaOptions, StdLib};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Instructions executed between deadline checks.
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

const DEADLINE_EXCEEDED: &str = "rule evaluation exceeded its wall-clock budget";

/// Resource governor settings for one VM.
#[derive(Debug, Clone)]
pub struct VmLimits {
    /// Absolute wall-clock deadline shared by every VM of one evaluation.
    pub deadline: Instant,
    pub memory_limit_bytes: usize,
}

/// Build a sandboxed VM with the resource governor installed.
///
/// `timed_out` is raised by the hook when the deadline passes so the caller
/// can tell a timeout apart from an ordinary script error.
pub(crate) fn new_sandboxed_vm(
    limits: &VmLimits,
    script_name: &str,
    timed_out: Arc<AtomicBool>,
) -> LuaResult<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;

    sandbox_globals(&lua)?;
    guard_protected_calls(&lua, timed_out.clone())?;
    register_log_api(&lua, script_name)?;

    let deadline = limits.deadline;
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                timed_out.store(true, Ordering::SeqCst);
                Err(mlua::Error::RuntimeError(DEADLINE_EXCEEDED.to_string()))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    // Applied last so the host setup above is not charged against the script.
    lua.set_memory_limit(limits.memory_limit_bytes)?;

    Ok(lua)
}

/// Remove every primitive that could reach outside the VM or load code.
pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in [
        "os",
        "io",
        "debug",
        "package",
        "require",
        "load",
        "loadfile",
        "dofile",
        "collectgarbage",
    ] {
        globals.set(name, LuaValue::Nil)?;
    }
    if let Ok(string) = globals.get::<LuaTable>("string") {
        string.set("dump", LuaValue::Nil)?;
    }
    Ok(())
}

/// Replace `pcall` and `xpcall` with wrappers that re-raise once the
/// deadline has passed, so a script cannot swallow its own abort.
fn guard_protected_calls(lua: &Lua, timed_out: Arc<AtomicBool>) -> LuaResult<()> {
    let globals = lua.globals();
    for name in ["pcall", "xpcall"] {
        let key = format!("mailtrace.{}", name);
        let original: LuaFunction = globals.get(name)?;
        lua.set_named_registry_value(&key, original)?;

        let flag = timed_out.clone();
        let guarded = lua.create_function(move |lua, args: LuaMultiValue| {
            let original: LuaFunction = lua.named_registry_value(&key)?;
            let ret: LuaMultiValue = original.call(args)?;
            if flag.load(Ordering::SeqCst) {
                return Err(LuaError::RuntimeError(DEADLINE_EXCEEDED.to_string()));
            }
            Ok(ret)
        })?;
        globals.set(name, guarded)?;
    }
    Ok(())
}

fn register_log_api(lua: &Lua, script_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;

    let n = script_name.to_string();
    log.set(
        "info",
        lua.create_function(move |_lua, msg: String| {
            tracing::info!(rule = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "warn",
        lua.create_function(move |_lua, msg: String| {
            tracing::warn!(rule = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "debug",
        lua.create_function(move |_lua, msg: String| {
            tracing::debug!(rule = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

/// True when the error (or any wrapped cause) is an allocator refusal.
pub(crate) fn is_memory_error(err: &LuaError) -> bool {
    match err {
        LuaError::MemoryError(_) => true,
        LuaError::CallbackError { cause, .. } => is_memory_error(cause),
        LuaError::WithContext { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

/// Convert a JSON value to a Lua value.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value.
///
/// Tables with a positive raw length are treated as arrays, everything
/// else as objects. Functions and userdata become `null`.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::new();
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}
