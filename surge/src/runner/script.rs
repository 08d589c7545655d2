use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use mlua::{Function, Lua, Table, Value};
use parking_lot::{Mutex, RwLock};

use surge_core::duration::parse_duration;
use surge_core::options::{OptField, Options};
use surge_core::source::SourceData;
use surge_core::{CancelSignal, GroupId, GroupTree, HttpClient, Runner, Vu};
use surge_metrics::{MetricKind, Registry, Sample, SampleTags, ValueContains};

use super::HttpMetricIds;

const REG_CURRENT_GROUP: &str = "surge_current_group";

/// The scripted runner: each VU owns its own Lua state and executes the
/// script's `Default()` function once per iteration. A script without a
/// `Default` function is treated as a bare iteration body, so a one-line
/// scenario works straight from the command line.
///
/// Script API (globals): `check(name, value)`, `group(name, fn)`,
/// `sleep(seconds)`, `counter/gauge/rate/trend(name, value)`,
/// `http_get(url)`; `__VU` holds the worker id.
pub struct LuaRunner {
    source: Arc<str>,
    chunk_name: String,
    groups: Arc<GroupTree>,
    registry: Arc<Registry>,
    options: Options,
    client: RwLock<Arc<HttpClient>>,
    ids: HttpMetricIds,
    has_default: bool,
}

impl LuaRunner {
    /// Load and validate the script once with a throwaway state (its checks
    /// and samples go nowhere), detecting `Default` and reading the
    /// `options` global.
    pub async fn new(src: &SourceData, registry: Arc<Registry>) -> anyhow::Result<Self> {
        let source = std::str::from_utf8(&src.data)
            .context("script is not valid UTF-8")?
            .to_string();
        let chunk_name = src.filename.clone();

        let ids = HttpMetricIds::register(&registry);
        let client = Arc::new(HttpClient::default());

        let lua = Lua::new();
        register_api(
            &lua,
            Arc::new(GroupTree::default()),
            registry.clone(),
            ids,
            client.clone(),
            Arc::new(Mutex::new(Vec::new())),
        )
        .map_err(|err| anyhow::anyhow!("failed to set up the script API: {err}"))?;

        lua.load(&source)
            .set_name(&chunk_name)
            .exec_async()
            .await
            .map_err(|err| anyhow::anyhow!("script load failed: {err}"))?;

        let has_default = lua.globals().get::<Function>("Default").is_ok();
        let options = parse_script_options(&lua)?;

        Ok(Self {
            source: Arc::from(source),
            chunk_name,
            groups: Arc::new(GroupTree::default()),
            registry,
            options,
            client: RwLock::new(client),
            ids,
            has_default,
        })
    }
}

impl Runner for LuaRunner {
    fn options(&self) -> Options {
        self.options.clone()
    }

    fn apply_options(&self, options: &Options) -> anyhow::Result<()> {
        if let Some(max_redirects) = options.max_redirects.value {
            *self.client.write() = Arc::new(HttpClient::with_max_redirects(max_redirects as usize));
        }
        Ok(())
    }

    fn groups(&self) -> Arc<GroupTree> {
        self.groups.clone()
    }

    fn new_vu(&self) -> anyhow::Result<Box<dyn Vu>> {
        let lua = Lua::new();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        register_api(
            &lua,
            self.groups.clone(),
            self.registry.clone(),
            self.ids,
            self.client.read().clone(),
            buffer.clone(),
        )
        .map_err(|err| anyhow::anyhow!("failed to set up the script API: {err}"))?;

        Ok(Box::new(LuaVu {
            lua,
            source: self.source.clone(),
            chunk_name: self.chunk_name.clone(),
            has_default: self.has_default,
            entry: None,
            buffer,
        }))
    }
}

struct LuaVu {
    lua: Lua,
    source: Arc<str>,
    chunk_name: String,
    has_default: bool,
    /// Resolved lazily on the first iteration: the script's `Default`
    /// function, or the compiled chunk body itself.
    entry: Option<Function>,
    buffer: Arc<Mutex<Vec<Sample>>>,
}

impl LuaVu {
    async fn entry(&mut self) -> anyhow::Result<Function> {
        if let Some(entry) = &self.entry {
            return Ok(entry.clone());
        }

        let entry = if self.has_default {
            self.lua
                .load(self.source.as_ref())
                .set_name(&self.chunk_name)
                .exec_async()
                .await
                .map_err(|err| anyhow::anyhow!("script init failed: {err}"))?;
            // Anything emitted by top-level code belongs to init, not to the
            // first iteration.
            self.buffer.lock().clear();

            self.lua
                .globals()
                .get::<Function>("Default")
                .map_err(|err| anyhow::anyhow!("script has no Default function: {err}"))?
        } else {
            self.lua
                .load(self.source.as_ref())
                .set_name(&self.chunk_name)
                .into_function()
                .map_err(|err| anyhow::anyhow!("script compile failed: {err}"))?
        };

        self.entry = Some(entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl Vu for LuaVu {
    fn reconfigure(&mut self, id: u64) -> anyhow::Result<()> {
        self.lua
            .globals()
            .set("__VU", id)
            .map_err(|err| anyhow::anyhow!("failed to bind VU id: {err}"))
    }

    async fn run_once(&mut self, _cancel: &CancelSignal) -> anyhow::Result<Vec<Sample>> {
        let entry = self.entry().await?;

        self.buffer.lock().clear();
        entry
            .call_async::<()>(())
            .await
            .map_err(|err| anyhow::anyhow!("script error: {err}"))?;

        Ok(std::mem::take(&mut *self.buffer.lock()))
    }
}

fn value_truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

fn current_group(lua: &Lua) -> Option<GroupId> {
    lua.named_registry_value::<Option<u32>>(REG_CURRENT_GROUP)
        .ok()
        .flatten()
        .map(GroupId::from_raw)
}

fn set_current_group(lua: &Lua, group: Option<GroupId>) -> mlua::Result<()> {
    lua.set_named_registry_value(REG_CURRENT_GROUP, group.map(GroupId::to_raw))
}

fn register_api(
    lua: &Lua,
    groups: Arc<GroupTree>,
    registry: Arc<Registry>,
    ids: HttpMetricIds,
    client: Arc<HttpClient>,
    buffer: Arc<Mutex<Vec<Sample>>>,
) -> mlua::Result<()> {
    let globals = lua.globals();

    {
        let groups = groups.clone();
        let check = lua.create_function(move |lua, (name, value): (String, Value)| {
            let pass = value_truthy(&value);
            let group = current_group(lua).unwrap_or(groups.root());
            groups.record_check(group, &name, pass);
            Ok(pass)
        })?;
        globals.set("check", check)?;
    }

    {
        let groups = groups.clone();
        let group = lua.create_async_function(move |lua, (name, func): (String, Function)| {
            let groups = groups.clone();
            async move {
                let prev = current_group(&lua);
                let id = groups.child(prev.unwrap_or(groups.root()), &name);
                set_current_group(&lua, Some(id))?;

                let res = func.call_async::<Value>(()).await;

                // Always restore, even when the body errored.
                set_current_group(&lua, prev)?;
                res
            }
        })?;
        globals.set("group", group)?;
    }

    let sleep = lua.create_async_function(|_, secs: f64| async move {
        if secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
        Ok::<(), mlua::Error>(())
    })?;
    globals.set("sleep", sleep)?;

    for (global, kind) in [
        ("counter", MetricKind::Counter),
        ("gauge", MetricKind::Gauge),
        ("trend", MetricKind::Trend),
    ] {
        let registry = registry.clone();
        let buffer = buffer.clone();
        let emit = lua.create_function(move |_, (name, value): (String, f64)| {
            if name.is_empty() {
                return Err(mlua::Error::external("metric name cannot be empty"));
            }
            let id = registry.register(&name, kind, ValueContains::Default);
            buffer.lock().push(Sample::new(id, value));
            Ok(())
        })?;
        globals.set(global, emit)?;
    }

    {
        let registry = registry.clone();
        let buffer = buffer.clone();
        let emit = lua.create_function(move |_, (name, value): (String, Value)| {
            if name.is_empty() {
                return Err(mlua::Error::external("metric name cannot be empty"));
            }
            let hit = match &value {
                Value::Boolean(b) => *b,
                Value::Integer(n) => *n != 0,
                Value::Number(n) => *n != 0.0,
                other => value_truthy(other),
            };
            let id = registry.register(&name, MetricKind::Rate, ValueContains::Default);
            buffer
                .lock()
                .push(Sample::new(id, if hit { 1.0 } else { 0.0 }));
            Ok(())
        })?;
        globals.set("rate", emit)?;
    }

    {
        let http_get = lua.create_async_function(move |lua, url: String| {
            let client = client.clone();
            let buffer = buffer.clone();
            async move {
                let started = Instant::now();
                let result = client.get(&url).await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;

                let tags: SampleTags = vec![
                    (Arc::from("url"), Arc::from(url.as_str())),
                    (Arc::from("method"), Arc::from("GET")),
                ];

                let out = lua.create_table()?;
                let failed = match &result {
                    Ok(response) => {
                        out.set("status", response.status)?;
                        if let Some(body) = response.body_utf8() {
                            out.set("body", body)?;
                        }
                        response.status >= 400
                    }
                    Err(err) => {
                        out.set("status", 0)?;
                        out.set("error", err.to_string())?;
                        true
                    }
                };

                let mut buf = buffer.lock();
                buf.push(Sample::with_tags(ids.reqs, 1.0, tags.clone()));
                buf.push(Sample::with_tags(ids.duration, elapsed_ms, tags.clone()));
                buf.push(Sample::with_tags(
                    ids.failed,
                    if failed { 1.0 } else { 0.0 },
                    tags,
                ));

                Ok(out)
            }
        })?;
        globals.set("http_get", http_get)?;
    }

    Ok(())
}

fn parse_script_options(lua: &Lua) -> anyhow::Result<Options> {
    let mut out = Options::default();
    let Ok(table) = lua.globals().get::<Table>("options") else {
        return Ok(out);
    };

    out.vus = get_int(&table, "vus")?;
    out.vus_max = {
        let field = get_int(&table, "vus_max")?;
        if field.valid { field } else { get_int(&table, "max")? }
    };
    out.duration = get_script_duration(&table)?;
    out.paused = get_bool(&table, "paused")?;
    out.linger = get_bool(&table, "linger")?;
    out.abort_on_taint = get_bool(&table, "abort_on_taint")?;
    out.acceptance = get_float(&table, "acceptance")?;
    out.max_redirects = get_int(&table, "max_redirects")?;
    out.thresholds = get_thresholds(&table)?;

    Ok(out)
}

fn get_int(table: &Table, key: &str) -> anyhow::Result<OptField<i64>> {
    match table.get::<Option<i64>>(key) {
        Ok(Some(v)) => Ok(OptField::some(v)),
        Ok(None) => Ok(OptField::unset()),
        Err(_) => anyhow::bail!("options.{key} must be an integer"),
    }
}

fn get_float(table: &Table, key: &str) -> anyhow::Result<OptField<f64>> {
    match table.get::<Option<f64>>(key) {
        Ok(Some(v)) => Ok(OptField::some(v)),
        Ok(None) => Ok(OptField::unset()),
        Err(_) => anyhow::bail!("options.{key} must be a number"),
    }
}

fn get_bool(table: &Table, key: &str) -> anyhow::Result<OptField<bool>> {
    match table.get::<Option<bool>>(key) {
        Ok(Some(v)) => Ok(OptField::some(v)),
        Ok(None) => Ok(OptField::unset()),
        Err(_) => anyhow::bail!("options.{key} must be a boolean"),
    }
}

fn get_script_duration(table: &Table) -> anyhow::Result<OptField<Duration>> {
    match table.get::<Value>("duration") {
        Ok(Value::Nil) | Err(_) => Ok(OptField::unset()),
        Ok(Value::String(s)) => {
            let raw = s.to_string_lossy().to_string();
            parse_duration(&raw)
                .map(OptField::some)
                .map_err(|err| anyhow::anyhow!("options.duration: {err}"))
        }
        Ok(Value::Integer(secs)) if secs >= 0 => {
            Ok(OptField::some(Duration::from_secs(secs as u64)))
        }
        Ok(Value::Number(secs)) if secs >= 0.0 => {
            Ok(OptField::some(Duration::from_secs_f64(secs)))
        }
        Ok(_) => anyhow::bail!("options.duration must be a duration string or seconds"),
    }
}

fn get_thresholds(
    table: &Table,
) -> anyhow::Result<std::collections::BTreeMap<String, Vec<String>>> {
    let mut out = std::collections::BTreeMap::new();
    let thresholds = match table.get::<Value>("thresholds") {
        Ok(Value::Table(t)) => t,
        Ok(Value::Nil) | Err(_) => return Ok(out),
        Ok(_) => anyhow::bail!("options.thresholds must be a table"),
    };

    for pair in thresholds.pairs::<String, Value>() {
        let (metric, exprs) =
            pair.map_err(|err| anyhow::anyhow!("options.thresholds: {err}"))?;
        let exprs = match exprs {
            Value::String(s) => vec![s.to_string_lossy().to_string()],
            Value::Table(seq) => {
                let mut list = Vec::new();
                for item in seq.sequence_values::<String>() {
                    list.push(item.map_err(|err| {
                        anyhow::anyhow!("options.thresholds.{metric}: {err}")
                    })?);
                }
                list
            }
            _ => anyhow::bail!("options.thresholds.{metric} must be a string or a list"),
        };
        out.insert(metric, exprs);
    }

    Ok(out)
}
