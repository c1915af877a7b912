//! Untrusted script execution
//!
//! Mapper targets and alert conditions are Lua function bodies evaluated in
//! a fresh VM per invocation. The VM sees only the documented globals:
//! `msg`, `db.get`/`db.all` (read-only SQL against the analytical store)
//! and `now_ms()`. The stdlib is restricted to table/string/math; there is
//! no filesystem, network or environment access, and no state survives an
//! invocation. A wall-time cap is enforced at Lua instruction boundaries
//! and at every `db.*` call.

pub mod sql_guard;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib, VmState};
use serde::Serialize;
use serde_json::Value;

/// The `msg` value injected into every fragment.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptMsg {
    pub topic: String,
    pub payload: Value,
    pub broker_id: String,
}

/// Result of one sandbox invocation. All variants are non-fatal to the
/// engines.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The fragment returned a value.
    Ok(Value),
    /// The fragment returned nil.
    Skipped,
    /// The wall-time cap fired.
    Timeout,
    /// Script raised, failed to parse, or returned an unconvertible value.
    SandboxError(String),
    /// A `db.*` call was rejected or failed.
    SqlError(String),
}

/// Enforcement limits for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    /// Wall time cap per invocation.
    pub wall_time: Duration,
    /// Result size cap for `db.all`.
    pub max_rows: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            wall_time: Duration::from_millis(500),
            max_rows: 10_000,
        }
    }
}

/// Factory for sandbox invocations bound to one analytical store file.
#[derive(Debug, Clone)]
pub struct Sandbox {
    db_path: PathBuf,
    limits: SandboxLimits,
}

/// How often the instruction hook checks the deadline.
const HOOK_INSTRUCTION_INTERVAL: u32 = 2_048;

impl Sandbox {
    pub fn new(db_path: impl AsRef<Path>, limits: SandboxLimits) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            limits,
        }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Evaluate a fragment. Runs on the blocking pool; an outer timeout
    /// backstops the instruction hook.
    pub async fn evaluate(&self, code: &str, msg: ScriptMsg) -> Outcome {
        let code = code.to_string();
        let db_path = self.db_path.clone();
        let limits = self.limits;

        let grace = limits.wall_time * 3 + Duration::from_secs(1);
        let task =
            tokio::task::spawn_blocking(move || eval_blocking(&code, &msg, &db_path, limits));

        match tokio::time::timeout(grace, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => Outcome::SandboxError(format!("sandbox task failed: {join_err}")),
            Err(_) => Outcome::Timeout,
        }
    }
}

/// Truthiness for alert predicates: everything except nil/false is truthy,
/// matching Lua semantics after conversion.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn eval_blocking(code: &str, msg: &ScriptMsg, db_path: &Path, limits: SandboxLimits) -> Outcome {
    let lua = match Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    ) {
        Ok(lua) => lua,
        Err(e) => return Outcome::SandboxError(format!("vm init failed: {e}")),
    };

    let deadline = Instant::now() + limits.wall_time;
    let timed_out = Arc::new(AtomicBool::new(false));
    let sql_error: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));

    {
        let timed_out = Arc::clone(&timed_out);
        lua.set_hook(
            mlua::HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_lua, _debug| {
                if Instant::now() >= deadline {
                    timed_out.store(true, Ordering::Relaxed);
                    Err(mlua::Error::RuntimeError(
                        "wall time cap exceeded".to_string(),
                    ))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
    }

    if let Err(e) = install_globals(&lua, msg, db_path, limits, deadline, &timed_out, &sql_error) {
        return Outcome::SandboxError(format!("sandbox setup failed: {e}"));
    }

    let result = lua
        .load(code)
        .set_name("fragment")
        .call::<mlua::Value>(());

    match result {
        Ok(mlua::Value::Nil) => Outcome::Skipped,
        Ok(value) => match lua.from_value::<Value>(value) {
            Ok(json) => Outcome::Ok(json),
            Err(e) => Outcome::SandboxError(format!("unconvertible return value: {e}")),
        },
        Err(e) => {
            if timed_out.load(Ordering::Relaxed) {
                Outcome::Timeout
            } else if let Some(sql) = sql_error.borrow_mut().take() {
                Outcome::SqlError(sql)
            } else {
                Outcome::SandboxError(script_error_message(&e))
            }
        }
    }
}

/// Strip the mlua callback-chain noise down to the script-facing message.
fn script_error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) | mlua::Error::SyntaxError { message: msg, .. } => {
            msg.clone()
        }
        mlua::Error::CallbackError { cause, .. } => script_error_message(cause),
        other => other.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn install_globals(
    lua: &Lua,
    msg: &ScriptMsg,
    db_path: &Path,
    limits: SandboxLimits,
    deadline: Instant,
    timed_out: &Arc<AtomicBool>,
    sql_error: &Rc<RefCell<Option<String>>>,
) -> mlua::Result<()> {
    let globals = lua.globals();

    // The base library ships a few escape hatches the boundary forbids.
    for name in ["print", "load", "loadstring", "dofile", "loadfile", "collectgarbage"] {
        globals.set(name, mlua::Value::Nil)?;
    }

    globals.set("msg", lua.to_value(msg)?)?;

    globals.set(
        "now_ms",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp_millis()))?,
    )?;

    // A read-only connection per invocation. Opening lazily on first db.*
    // call keeps pure fragments free of sqlite work.
    let conn: Rc<RefCell<Option<rusqlite::Connection>>> = Rc::new(RefCell::new(None));
    let db_path = db_path.to_path_buf();

    let db = lua.create_table()?;

    let open_conn = {
        let conn = Rc::clone(&conn);
        let db_path = db_path.clone();
        move || -> Result<(), String> {
            let mut slot = conn.borrow_mut();
            if slot.is_none() {
                let opened = rusqlite::Connection::open_with_flags(
                    &db_path,
                    rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                        | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| format!("db open failed: {e}"))?;
                let _ = opened.busy_timeout(Duration::from_millis(50));
                *slot = Some(opened);
            }
            Ok(())
        }
    };

    let run_query = {
        let conn = Rc::clone(&conn);
        let sql_error = Rc::clone(&sql_error);
        let timed_out = Arc::clone(timed_out);
        move |sql: &str, max_rows: usize| -> Result<Vec<Value>, mlua::Error> {
            let raise = |slot: &Rc<RefCell<Option<String>>>, message: String| {
                *slot.borrow_mut() = Some(message.clone());
                mlua::Error::RuntimeError(message)
            };

            if Instant::now() >= deadline {
                timed_out.store(true, Ordering::Relaxed);
                return Err(mlua::Error::RuntimeError(
                    "wall time cap exceeded".to_string(),
                ));
            }

            let checked = sql_guard::check_read_only(sql)
                .map_err(|reason| raise(&sql_error, format!("rejected statement: {reason}")))?;

            open_conn().map_err(|e| raise(&sql_error, e))?;
            let conn_ref = conn.borrow();
            let Some(conn_ref) = conn_ref.as_ref() else {
                return Err(raise(&sql_error, "db connection unavailable".to_string()));
            };

            let mut stmt = conn_ref
                .prepare(&checked)
                .map_err(|e| raise(&sql_error, format!("prepare failed: {e}")))?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();

            let mut rows = stmt
                .query([])
                .map_err(|e| raise(&sql_error, format!("query failed: {e}")))?;

            let mut out = Vec::new();
            loop {
                if Instant::now() >= deadline {
                    timed_out.store(true, Ordering::Relaxed);
                    return Err(mlua::Error::RuntimeError(
                        "wall time cap exceeded".to_string(),
                    ));
                }
                match rows.next() {
                    Ok(Some(row)) => {
                        let mut obj = serde_json::Map::new();
                        for (i, name) in column_names.iter().enumerate() {
                            obj.insert(name.clone(), sql_value_to_json(row, i));
                        }
                        out.push(Value::Object(obj));
                        if out.len() >= max_rows {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(raise(&sql_error, format!("row read failed: {e}"))),
                }
            }
            Ok(out)
        }
    };

    let get = {
        let run_query = run_query.clone();
        lua.create_function(move |lua, sql: String| {
            let mut rows = run_query(&sql, 1)?;
            match rows.pop() {
                Some(row) => lua.to_value(&row),
                None => Ok(mlua::Value::Nil),
            }
        })?
    };

    let all = {
        let max_rows = limits.max_rows;
        lua.create_function(move |lua, sql: String| {
            let rows = run_query(&sql, max_rows)?;
            lua.to_value(&rows)
        })?
    };

    db.set("get", get)?;
    db.set("all", all)?;
    globals.set("db", db)?;

    Ok(())
}

fn sql_value_to_json(row: &rusqlite::Row<'_>, idx: usize) -> Value {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx) {
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Integer(i)) => Value::from(i),
        Ok(ValueRef::Real(f)) => Value::from(f),
        Ok(ValueRef::Text(t)) => Value::from(String::from_utf8_lossy(t).into_owned()),
        Ok(ValueRef::Blob(b)) => Value::from(String::from_utf8_lossy(b).into_owned()),
        Err(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::Event;

    fn msg(topic: &str, payload: Value) -> ScriptMsg {
        ScriptMsg {
            topic: topic.to_string(),
            payload,
            broker_id: "b1".to_string(),
        }
    }

    fn sandbox_with_store() -> (tempfile::TempDir, Sandbox, std::sync::Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.db");
        let store = std::sync::Arc::new(Store::open(&path, u64::MAX).unwrap());
        let sandbox = Sandbox::new(&path, SandboxLimits::default());
        (dir, sandbox, store)
    }

    #[tokio::test]
    async fn identity_fragment_returns_msg() {
        let (_dir, sandbox, _store) = sandbox_with_store();
        let outcome = sandbox
            .evaluate("return msg", msg("a/b", serde_json::json!({"value": 22.5})))
            .await;

        match outcome {
            Outcome::Ok(v) => {
                assert_eq!(v["topic"], "a/b");
                assert_eq!(v["payload"]["value"], 22.5);
                assert_eq!(v["broker_id"], "b1");
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nil_return_is_skipped() {
        let (_dir, sandbox, _store) = sandbox_with_store();
        let outcome = sandbox
            .evaluate("return nil", msg("a/b", Value::Null))
            .await;
        assert_eq!(outcome, Outcome::Skipped);

        let outcome = sandbox.evaluate("local x = 1", msg("a/b", Value::Null)).await;
        assert_eq!(outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let (_dir, mut_sandbox, _store) = sandbox_with_store();
        let sandbox = Sandbox {
            limits: SandboxLimits {
                wall_time: Duration::from_millis(100),
                ..SandboxLimits::default()
            },
            ..mut_sandbox
        };

        let started = Instant::now();
        let outcome = sandbox
            .evaluate("while true do end", msg("a/b", Value::Null))
            .await;
        assert_eq!(outcome, Outcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn script_error_is_contained() {
        let (_dir, sandbox, _store) = sandbox_with_store();
        let outcome = sandbox
            .evaluate("error('boom')", msg("a/b", Value::Null))
            .await;
        match outcome {
            Outcome::SandboxError(e) => assert!(e.contains("boom")),
            other => panic!("expected SandboxError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn syntax_error_is_contained() {
        let (_dir, sandbox, _store) = sandbox_with_store();
        let outcome = sandbox
            .evaluate("return ][", msg("a/b", Value::Null))
            .await;
        assert!(matches!(outcome, Outcome::SandboxError(_)));
    }

    #[tokio::test]
    async fn db_get_reads_events() {
        let (_dir, sandbox, store) = sandbox_with_store();
        store
            .append_event(&Event::new("b1", "a/b", br#"{"v":1}"#.to_vec()))
            .unwrap();

        let outcome = sandbox
            .evaluate(
                "local row = db.get('SELECT topic FROM events LIMIT 1') return row.topic",
                msg("x", Value::Null),
            )
            .await;
        assert_eq!(outcome, Outcome::Ok(Value::from("a/b")));
    }

    #[tokio::test]
    async fn db_all_returns_rows_and_caps() {
        let (_dir, sandbox, store) = sandbox_with_store();
        for i in 0..5 {
            store
                .append_event(&Event::new("b1", format!("t/{i}"), b"x".to_vec()))
                .unwrap();
        }

        let sandbox = Sandbox {
            limits: SandboxLimits {
                max_rows: 3,
                ..SandboxLimits::default()
            },
            ..sandbox
        };
        let outcome = sandbox
            .evaluate(
                "local rows = db.all('SELECT topic FROM events') return #rows",
                msg("x", Value::Null),
            )
            .await;
        assert_eq!(outcome, Outcome::Ok(Value::from(3)));
    }

    #[tokio::test]
    async fn mutating_sql_is_rejected() {
        let (_dir, sandbox, store) = sandbox_with_store();
        store
            .append_event(&Event::new("b1", "a/b", b"x".to_vec()))
            .unwrap();

        let outcome = sandbox
            .evaluate(
                "return db.all('DELETE FROM events')",
                msg("x", Value::Null),
            )
            .await;
        assert!(matches!(outcome, Outcome::SqlError(_)), "{outcome:?}");

        // The row survived
        assert!(store.get_latest(None, "a/b").unwrap().is_some());
    }

    #[tokio::test]
    async fn pragma_is_rejected() {
        let (_dir, sandbox, _store) = sandbox_with_store();
        let outcome = sandbox
            .evaluate(
                "return db.get('PRAGMA journal_mode')",
                msg("x", Value::Null),
            )
            .await;
        assert!(matches!(outcome, Outcome::SqlError(_)));
    }

    #[tokio::test]
    async fn no_ambient_authority() {
        let (_dir, sandbox, _store) = sandbox_with_store();
        for fragment in [
            "return os ~= nil",
            "return io ~= nil",
            "return require ~= nil",
            "return load ~= nil",
        ] {
            let outcome = sandbox.evaluate(fragment, msg("x", Value::Null)).await;
            assert_eq!(outcome, Outcome::Ok(Value::Bool(false)), "{fragment}");
        }
    }

    #[tokio::test]
    async fn predicate_truthiness() {
        assert!(is_truthy(&Value::Bool(true)));
        assert!(is_truthy(&Value::from(0)));
        assert!(is_truthy(&Value::from("")));
        assert!(!is_truthy(&Value::Bool(false)));
        assert!(!is_truthy(&Value::Null));
    }

    #[tokio::test]
    async fn now_ms_is_host_clock() {
        let (_dir, sandbox, _store) = sandbox_with_store();
        let before = chrono::Utc::now().timestamp_millis();
        let outcome = sandbox.evaluate("return now_ms()", msg("x", Value::Null)).await;
        let after = chrono::Utc::now().timestamp_millis();

        match outcome {
            Outcome::Ok(Value::Number(n)) => {
                let t = n.as_i64().unwrap();
                assert!(t >= before && t <= after);
            }
            other => panic!("expected number, got {other:?}"),
        }
    }
}
