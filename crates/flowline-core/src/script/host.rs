//! Host API bindings exposed to scripts.
//!
//! Namespaced bindings are rhai static modules, so scripts call
//! `console::log`, `event::publish`, `cache::get`. `fetch`, `model`,
//! `select` and `query` are top-level, as are the control signals
//! `done()`, `stop()`, `go_to(step)` and `pin(key, value)`.
//!
//! Collaborator errors are raised as runtime errors inside the script;
//! an unhandled one fails the step and triggers rollback.

use std::sync::Arc;
use std::time::Duration;

use flowline_types::{ContextMap, HostError};
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, Module, Shared};
use serde_json::Value;

use crate::control::Controls;
use crate::services::Services;

pub(crate) fn register(engine: &mut Engine, services: Arc<Services>, controls: Arc<Controls>) {
    register_console(engine);
    register_events(engine, &services);
    register_cache(engine, &services);
    register_fetch(engine, &services);
    register_data(engine, &services);
    register_controls(engine, &controls);
}

fn host_err(err: HostError) -> Box<EvalAltResult> {
    err.to_string().into()
}

fn map_to_json(map: Map) -> Result<ContextMap, Box<EvalAltResult>> {
    rhai::serde::from_dynamic(&Dynamic::from_map(map))
}

fn value_to_dynamic(value: Value) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

// ---------------------------------------------------------------------------
// console
// ---------------------------------------------------------------------------

fn register_console(engine: &mut Engine) {
    let mut module = Module::new();

    module.set_native_fn("log", |value: Dynamic| {
        tracing::info!(target: "flowline::script", "{value}");
        Ok(())
    });
    module.set_native_fn("log", |a: Dynamic, b: Dynamic| {
        tracing::info!(target: "flowline::script", "{a} {b}");
        Ok(())
    });
    module.set_native_fn("debug", |value: Dynamic| {
        tracing::debug!(target: "flowline::script", "{value}");
        Ok(())
    });
    module.set_native_fn("info", |value: Dynamic| {
        tracing::info!(target: "flowline::script", "{value}");
        Ok(())
    });
    module.set_native_fn("error", |message: ImmutableString| {
        tracing::error!(target: "flowline::script", "{message}");
        Ok(())
    });

    engine.register_static_module("console", Shared::new(module));
}

// ---------------------------------------------------------------------------
// event
// ---------------------------------------------------------------------------

fn register_events(engine: &mut Engine, services: &Arc<Services>) {
    let mut module = Module::new();

    let bus = Arc::clone(&services.bus);
    module.set_native_fn("publish", move |channel: ImmutableString, data: Map| {
        let payload = map_to_json(data)?;
        bus.publish(&channel, Value::Object(payload));
        Ok(())
    });

    let bus = Arc::clone(&services.bus);
    module.set_native_fn("work", move |channel: ImmutableString, data: Map| {
        let payload = map_to_json(data)?;
        bus.work(&channel, Value::Object(payload));
        Ok(())
    });

    // `source` shares publish semantics; the distinction belongs to the bus.
    let bus = Arc::clone(&services.bus);
    module.set_native_fn("source", move |channel: ImmutableString, data: Map| {
        let payload = map_to_json(data)?;
        bus.publish(&channel, Value::Object(payload));
        Ok(())
    });

    engine.register_static_module("event", Shared::new(module));
}

// ---------------------------------------------------------------------------
// cache
// ---------------------------------------------------------------------------

fn register_cache(engine: &mut Engine, services: &Arc<Services>) {
    let mut module = Module::new();

    let cache = Arc::clone(&services.cache);
    module.set_native_fn(
        "set",
        move |key: ImmutableString, value: Dynamic, minutes: i64| {
            let value: Value = rhai::serde::from_dynamic(&value)?;
            let ttl = Duration::from_secs(minutes.max(0) as u64 * 60);
            let stored = cache.set(&key, value, ttl).map_err(host_err)?;
            value_to_dynamic(stored)
        },
    );

    let cache = Arc::clone(&services.cache);
    module.set_native_fn("get", move |key: ImmutableString, default: Dynamic| {
        let default: Value = rhai::serde::from_dynamic(&default)?;
        let value = cache.get(&key, default).map_err(host_err)?;
        value_to_dynamic(value)
    });

    let cache = Arc::clone(&services.cache);
    module.set_native_fn("delete", move |key: ImmutableString| {
        cache.delete(&key).map_err(host_err)
    });

    let cache = Arc::clone(&services.cache);
    module.set_native_fn("incr", move |key: ImmutableString, seconds: i64| {
        let ttl = Duration::from_secs(seconds.max(0) as u64);
        cache.incr(&key, ttl).map_err(host_err)
    });

    let cache = Arc::clone(&services.cache);
    module.set_native_fn("decr", move |key: ImmutableString| {
        cache.decr(&key).map_err(host_err)
    });

    engine.register_static_module("cache", Shared::new(module));
}

// ---------------------------------------------------------------------------
// fetch
// ---------------------------------------------------------------------------

fn register_fetch(engine: &mut Engine, services: &Arc<Services>) {
    let http = Arc::clone(&services.http);
    engine.register_fn(
        "fetch",
        move |method: ImmutableString, url: ImmutableString, headers: Map, body: Map| {
            let headers = map_to_json(headers)?;
            let body = map_to_json(body)?;
            let response = http
                .fetch(&method, &url, &headers, &body)
                .map_err(host_err)?;
            value_to_dynamic(response)
        },
    );
}

// ---------------------------------------------------------------------------
// model / select / query
// ---------------------------------------------------------------------------

fn register_data(engine: &mut Engine, services: &Arc<Services>) {
    let data = Arc::clone(&services.data);
    engine.register_fn(
        "model",
        move |database: ImmutableString, name: ImmutableString| {
            let handle = data.model(&database, &name).map_err(host_err)?;
            value_to_dynamic(handle)
        },
    );

    let data = Arc::clone(&services.data);
    engine.register_fn("select", move |query: Map| {
        let query = map_to_json(query)?;
        let rows = data.select(&query).map_err(host_err)?;
        value_to_dynamic(rows)
    });

    // `query` requires at least (database, sql); up to three trailing
    // positional parameters are accepted.
    let data = Arc::clone(&services.data);
    engine.register_fn(
        "query",
        move |database: ImmutableString, sql: ImmutableString| {
            let rows = data.query(&database, &sql, &[]).map_err(host_err)?;
            value_to_dynamic(rows)
        },
    );

    let data = Arc::clone(&services.data);
    engine.register_fn(
        "query",
        move |database: ImmutableString, sql: ImmutableString, p0: Dynamic| {
            let params = vec![rhai::serde::from_dynamic(&p0)?];
            let rows = data.query(&database, &sql, &params).map_err(host_err)?;
            value_to_dynamic(rows)
        },
    );

    let data = Arc::clone(&services.data);
    engine.register_fn(
        "query",
        move |database: ImmutableString, sql: ImmutableString, p0: Dynamic, p1: Dynamic| {
            let params = vec![
                rhai::serde::from_dynamic(&p0)?,
                rhai::serde::from_dynamic(&p1)?,
            ];
            let rows = data.query(&database, &sql, &params).map_err(host_err)?;
            value_to_dynamic(rows)
        },
    );

    let data = Arc::clone(&services.data);
    engine.register_fn(
        "query",
        move |database: ImmutableString,
              sql: ImmutableString,
              p0: Dynamic,
              p1: Dynamic,
              p2: Dynamic| {
            let params = vec![
                rhai::serde::from_dynamic(&p0)?,
                rhai::serde::from_dynamic(&p1)?,
                rhai::serde::from_dynamic(&p2)?,
            ];
            let rows = data.query(&database, &sql, &params).map_err(host_err)?;
            value_to_dynamic(rows)
        },
    );
}

// ---------------------------------------------------------------------------
// control signals
// ---------------------------------------------------------------------------

fn register_controls(engine: &mut Engine, controls: &Arc<Controls>) {
    let cell = Arc::clone(controls);
    engine.register_fn("done", move || cell.signal_done());

    let cell = Arc::clone(controls);
    engine.register_fn("stop", move || cell.signal_stop());

    let cell = Arc::clone(controls);
    engine.register_fn("go_to", move |step: i64| -> Result<(), Box<EvalAltResult>> {
        if step < 0 {
            return Err(format!("go_to target must be non-negative, got {step}").into());
        }
        cell.signal_goto(step as usize);
        Ok(())
    });

    let cell = Arc::clone(controls);
    engine.register_fn(
        "pin",
        move |key: ImmutableString, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let value: Value = rhai::serde::from_dynamic(&value)?;
            cell.pin(key.to_string(), value);
            Ok(())
        },
    );
}
