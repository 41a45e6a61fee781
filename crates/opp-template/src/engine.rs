//! Template engine for Open Peer Power
//!
//! Provides Jinja2-compatible rendering with state access, time functions
//! and the kernel's filters. State and time functions are bound per render
//! so that a render can be tracked without sharing tracking state between
//! concurrent renders.

use crate::error::TemplateResult;
use crate::filters;
use crate::globals::{self, TimeSource};
use crate::states::{self, RenderInfo, RenderTracker, StatesObject};
use chrono_tz::Tz;
use minijinja::value::ValueKind;
use minijinja::{Environment, Error, ErrorKind, Output, State, Value};
use opp_clock::Clock;
use opp_core::STATE_UNKNOWN;
use opp_state_machine::StateMachine;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Read a rendered template result as a boolean
///
/// `true`, `yes`, `on` and `enable` (any case) are true, as is any number
/// other than zero. Everything else is false.
pub fn result_as_boolean(rendered: &str) -> bool {
    let normalized = rendered.trim().to_lowercase();
    match normalized.as_str() {
        "true" | "yes" | "on" | "enable" => true,
        other => other
            .parse::<f64>()
            .map_or(false, |f| f != 0.0 && !f.is_nan()),
    }
}

/// Output formatter: booleans render as `True`/`False`, as in Jinja2
fn format_value(out: &mut Output<'_>, state: &State<'_, '_>, value: &Value) -> Result<(), Error> {
    if value.kind() == ValueKind::Bool {
        let text = if value.is_true() { "True" } else { "False" };
        return out
            .write_str(text)
            .map_err(|_| Error::from(ErrorKind::WriteFailure));
    }
    minijinja::escape_formatter(out, state, value)
}

/// Template engine bound to a state machine
///
/// The engine provides:
/// - Entity access via `states`, `state()`, `is_state()`, `state_attr()`,
///   `is_state_attr()` and `has_value()`
/// - Time functions `now()`, `utcnow()`, `today_at()`, `as_local()`,
///   `relative_time()`, `as_timestamp()`, `as_datetime()`, `timedelta()`
/// - Filters like `float`, `int`, `bool`, `round`, `regex_replace`,
///   `to_json` and `slugify`
pub struct TemplateEngine {
    env: Environment<'static>,
    state_machine: Arc<StateMachine>,
    clock: Arc<dyn Clock>,
    time_zone: Tz,
}

impl TemplateEngine {
    /// Create an engine reading `state_machine` and its clock, in UTC
    pub fn new(state_machine: Arc<StateMachine>) -> Self {
        let clock = Arc::clone(state_machine.clock());
        let mut env = Environment::new();
        env.set_debug(true);
        env.set_formatter(format_value);

        Self::register_filters(&mut env);
        Self::register_globals(&mut env);
        Self::register_tests(&mut env);

        Self {
            env,
            state_machine,
            clock,
            time_zone: Tz::UTC,
        }
    }

    /// Use `time_zone` for `now()`, `today_at()` and `as_local()`
    pub fn with_time_zone(mut self, time_zone: Tz) -> Self {
        self.time_zone = time_zone;
        self
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    fn register_filters(env: &mut Environment<'static>) {
        // Strings
        env.add_filter("slugify", filters::slugify);
        env.add_filter("regex_replace", filters::regex_replace);
        env.add_filter("regex_findall", filters::regex_findall);
        env.add_filter("regex_match", filters::regex_match);
        env.add_filter("regex_search", filters::regex_search);

        // Type conversion
        env.add_filter("float", filters::to_float);
        env.add_filter("int", filters::to_int);
        env.add_filter("bool", filters::to_bool);
        env.add_filter("is_number", filters::is_number);

        // Math
        env.add_filter("round", filters::round_filter);
        env.add_filter("average", filters::average);

        // JSON
        env.add_filter("to_json", filters::to_json);
        env.add_filter("from_json", filters::from_json);

        // Time
        env.add_filter("as_timestamp", globals::as_timestamp);
        env.add_filter("as_datetime", globals::as_datetime);
    }

    fn register_globals(env: &mut Environment<'static>) {
        env.add_function("as_timestamp", globals::as_timestamp);
        env.add_function("as_datetime", globals::as_datetime);
        env.add_function("timedelta", globals::timedelta);
        env.add_function("iif", globals::iif);
        env.add_function("float", filters::to_float);
        env.add_function("int", filters::to_int);
        env.add_function("bool", filters::to_bool);
        env.add_function("is_number", filters::is_number);
    }

    fn register_tests(env: &mut Environment<'static>) {
        env.add_test("match", filters::regex_match);
        env.add_test("search", filters::regex_search);
        env.add_test("is_number", filters::is_number);
    }

    /// Functions that read state or time, bound to one render
    fn render_context(&self, tracker: Option<Arc<RenderTracker>>, extra: Value) -> Value {
        let states = match &tracker {
            Some(t) => StatesObject::tracked(Arc::clone(&self.state_machine), Arc::clone(t)),
            None => StatesObject::new(Arc::clone(&self.state_machine)),
        };
        let time = TimeSource {
            clock: Arc::clone(&self.clock),
            time_zone: self.time_zone,
            tracker,
        };

        let mut ctx: BTreeMap<String, Value> = BTreeMap::new();
        ctx.insert("states".into(), Value::from_object(states.clone()));

        let s = states.clone();
        ctx.insert(
            "state".into(),
            Value::from_function(move |entity_id: &str| {
                s.get_state(entity_id)
                    .unwrap_or_else(|| STATE_UNKNOWN.to_string())
            }),
        );
        let s = states.clone();
        ctx.insert(
            "is_state".into(),
            Value::from_function(move |entity_id: &str, state: Value| {
                states::is_state_fn(&s, entity_id, state)
            }),
        );
        let s = states.clone();
        ctx.insert(
            "state_attr".into(),
            Value::from_function(move |entity_id: &str, attribute: &str| {
                s.state_attr(entity_id, attribute)
            }),
        );
        let s = states.clone();
        ctx.insert(
            "is_state_attr".into(),
            Value::from_function(move |entity_id: &str, attribute: &str, value: Value| {
                s.is_state_attr(entity_id, attribute, value)
            }),
        );
        let s = states;
        ctx.insert(
            "has_value".into(),
            Value::from_function(move |entity_id: &str| s.has_value(entity_id)),
        );

        let t = time.clone();
        ctx.insert("now".into(), Value::from_function(move || t.now()));
        let t = time.clone();
        ctx.insert("utcnow".into(), Value::from_function(move || t.utcnow()));
        let t = time.clone();
        ctx.insert(
            "today_at".into(),
            Value::from_function(move |at: Option<&str>| t.today_at(at)),
        );
        let t = time.clone();
        ctx.insert(
            "as_local".into(),
            Value::from_function(move |value: Value| t.as_local(value)),
        );
        let t = time;
        ctx.insert(
            "relative_time".into(),
            Value::from_function(move |value: Value| t.relative_time(value)),
        );

        if extra.kind() == ValueKind::Map {
            if let Ok(keys) = extra.try_iter() {
                for key in keys {
                    if let (Some(name), Ok(value)) = (key.as_str(), extra.get_item(&key)) {
                        ctx.insert(name.to_string(), value);
                    }
                }
            }
        }

        Value::from_object(ctx)
    }

    /// Check that `template` compiles
    pub fn compile(&self, template: &str) -> TemplateResult<()> {
        self.env.template_from_str(template)?;
        Ok(())
    }

    /// Render a template string
    pub fn render(&self, template: &str) -> TemplateResult<String> {
        self.render_inner(template, None, Value::UNDEFINED)
    }

    /// Render a template with additional context variables
    pub fn render_with_context(
        &self,
        template: &str,
        context: impl serde::Serialize,
    ) -> TemplateResult<String> {
        self.render_inner(template, None, Value::from_serialize(&context))
    }

    /// Render a template and report what it read while rendering
    ///
    /// The info is returned even when rendering fails, since a failed
    /// render may still depend on entities that could fix it.
    pub fn render_tracked(&self, template: &str) -> (TemplateResult<String>, RenderInfo) {
        let tracker = Arc::new(RenderTracker::new());
        let result = self.render_inner(template, Some(Arc::clone(&tracker)), Value::UNDEFINED);
        let info = tracker.info();
        trace!(
            entities = info.entities.len(),
            domains = info.domains.len(),
            all_states = info.all_states,
            "Tracked template render"
        );
        (result, info)
    }

    fn render_inner(
        &self,
        template: &str,
        tracker: Option<Arc<RenderTracker>>,
        extra: Value,
    ) -> TemplateResult<String> {
        debug!("Rendering template: {}", template);

        let tmpl = self.env.template_from_str(template)?;
        let result = tmpl.render(self.render_context(tracker, extra))?;
        Ok(result)
    }

    /// Evaluate an expression and return the value
    pub fn evaluate(&self, expression: &str) -> TemplateResult<Value> {
        let expr = self.env.compile_expression(expression)?;
        let result = expr.eval(self.render_context(None, Value::UNDEFINED))?;
        Ok(result)
    }

    /// Render a template and read the result as a boolean
    pub fn render_boolean(&self, template: &str) -> TemplateResult<bool> {
        self.render(template).map(|r| result_as_boolean(&r))
    }

    /// Check if a string contains template syntax
    pub fn is_template(template: &str) -> bool {
        template.contains("{{") || template.contains("{%") || template.contains("{#")
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("time_zone", &self.time_zone)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TemplateError;
    use chrono::{TimeZone, Utc};
    use opp_clock::MockClock;
    use opp_event_bus::EventBus;
    use opp_loop::EventLoop;
    use serde_json::json;

    fn make_test_engine() -> (TemplateEngine, Arc<StateMachine>) {
        let clock = MockClock::at(Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap());
        let bus = Arc::new(EventBus::new(EventLoop::with_workers(1), Arc::new(clock)));
        let sm = Arc::new(StateMachine::new(bus));

        sm.set(
            "light.living_room",
            "on",
            serde_json::from_value(json!({"brightness": 255, "friendly_name": "Living Room"}))
                .ok(),
            false,
            None,
        )
        .unwrap();
        sm.set("light.porch", "off", None, false, None).unwrap();
        sm.set("sensor.temperature", "23.5", None, false, None).unwrap();
        sm.set("switch.kitchen", "unavailable", None, false, None).unwrap();

        (TemplateEngine::new(sm.clone()), sm)
    }

    #[tokio::test]
    async fn test_plain_and_context_render() {
        let (engine, _) = make_test_engine();
        assert_eq!(engine.render("Hello, World!").unwrap(), "Hello, World!");
        assert_eq!(
            engine
                .render_with_context("Hello, {{ name }}!", json!({"name": "Test"}))
                .unwrap(),
            "Hello, Test!"
        );
    }

    #[tokio::test]
    async fn test_state_functions() {
        let (engine, _) = make_test_engine();
        assert_eq!(engine.render("{{ states('light.living_room') }}").unwrap(), "on");
        assert_eq!(engine.render("{{ states('light.missing') }}").unwrap(), "unknown");
        assert_eq!(engine.render("{{ state('sensor.temperature') }}").unwrap(), "23.5");
        assert_eq!(engine.render("{{ states.light.living_room.state }}").unwrap(), "on");
        assert_eq!(
            engine.render("{{ states['light.living_room'].name }}").unwrap(),
            "Living Room"
        );
        assert_eq!(
            engine.render("{{ is_state('light.living_room', 'on') }}").unwrap(),
            "True"
        );
        assert_eq!(
            engine.render("{{ is_state('light.porch', ['on', 'off']) }}").unwrap(),
            "True"
        );
        assert_eq!(
            engine.render("{{ state_attr('light.living_room', 'brightness') }}").unwrap(),
            "255"
        );
        assert_eq!(
            engine
                .render("{{ is_state_attr('light.living_room', 'brightness', 255) }}")
                .unwrap(),
            "True"
        );
        assert_eq!(engine.render("{{ has_value('switch.kitchen') }}").unwrap(), "False");
    }

    #[tokio::test]
    async fn test_domain_iteration() {
        let (engine, _) = make_test_engine();
        let rendered = engine
            .render("{% for s in states.light %}{{ s.entity_id }}={{ s.state }};{% endfor %}")
            .unwrap();
        assert_eq!(rendered, "light.living_room=on;light.porch=off;");
        assert_eq!(engine.render("{{ states | list | length }}").unwrap(), "4");
    }

    #[tokio::test]
    async fn test_numeric_comparison() {
        let (engine, sm) = make_test_engine();
        let template = "{{ state('sensor.temperature') | float > 20 }}";
        assert!(engine.render_boolean(template).unwrap());

        sm.set("sensor.temperature", "20.0", None, false, None).unwrap();
        assert!(!engine.render_boolean(template).unwrap());

        sm.set("sensor.temperature", "unknown", None, false, None).unwrap();
        assert!(engine.render(template).is_err());
        assert!(!engine
            .render_boolean("{{ state('sensor.temperature') | float(0) > 20 }}")
            .unwrap());
    }

    #[tokio::test]
    async fn test_render_tracked() {
        let (engine, _) = make_test_engine();

        let (result, info) = engine.render_tracked(
            "{{ is_state('light.living_room', 'on') and states('sensor.temperature') | float > 20 }}",
        );
        assert_eq!(result.unwrap(), "True");
        assert!(info.entities.contains("light.living_room"));
        assert!(info.entities.contains("sensor.temperature"));
        assert!(!info.uses_now);

        let (_, info) = engine.render_tracked("{{ states.light | list | length }} {{ now() }}");
        assert!(info.domains.contains("light"));
        assert!(info.uses_now);

        let (_, info) = engine.render_tracked("{{ states | list | length }}");
        assert!(info.all_states);
    }

    #[tokio::test]
    async fn test_tracked_failure_keeps_info() {
        let (engine, _) = make_test_engine();
        let (result, info) = engine.render_tracked("{{ states('sensor.missing') | float > 1 }}");
        assert!(result.is_err());
        assert!(info.entities.contains("sensor.missing"));
    }

    #[tokio::test]
    async fn test_time_functions_follow_clock_and_zone() {
        let (engine, _) = make_test_engine();
        let engine = engine.with_time_zone(chrono_tz::America::New_York);

        assert_eq!(engine.render("{{ utcnow().hour }}").unwrap(), "12");
        assert_eq!(engine.render("{{ now().hour }}").unwrap(), "8");
        assert_eq!(
            engine.render("{{ as_timestamp(utcnow()) | int }}").unwrap(),
            "1685620800"
        );
        assert_eq!(
            engine.render("{{ (now().sub(timedelta(hours=1))).hour }}").unwrap(),
            "7"
        );
    }

    #[tokio::test]
    async fn test_filters() {
        let (engine, _) = make_test_engine();
        assert_eq!(engine.render("{{ 3.14159 | round(2) }}").unwrap(), "3.14");
        assert_eq!(engine.render("{{ 'Hello World' | slugify }}").unwrap(), "hello_world");
        assert_eq!(
            engine.render("{{ 'hello world' | regex_replace('\\\\s+', '-') }}").unwrap(),
            "hello-world"
        );
        assert_eq!(engine.render("{{ [1, 2, 3] | average }}").unwrap(), "2.0");
        assert_eq!(engine.render("{{ 'on' | bool }}").unwrap(), "True");
        assert_eq!(engine.render("{{ '42' is is_number }}").unwrap(), "True");
        assert_eq!(engine.render("{{ iif(false, 'yes', 'no') }}").unwrap(), "no");
        let json = engine
            .render_with_context("{{ data | to_json }}", json!({"data": {"key": "value"}}))
            .unwrap();
        assert_eq!(json, r#"{"key":"value"}"#);
    }

    #[tokio::test]
    async fn test_errors() {
        let (engine, _) = make_test_engine();
        assert!(matches!(
            engine.compile("{{ states('x' }}"),
            Err(TemplateError::SyntaxError { .. })
        ));
        assert!(engine.compile("{{ states('x') }}").is_ok());
    }

    #[tokio::test]
    async fn test_evaluate() {
        let (engine, _) = make_test_engine();
        let value = engine.evaluate("states('sensor.temperature') | float * 2").unwrap();
        assert_eq!(f64::try_from(value).unwrap(), 47.0);
    }

    #[test]
    fn test_result_as_boolean() {
        for truthy in ["true", "True", " on ", "yes", "enable", "1", "2.5", "-1"] {
            assert!(result_as_boolean(truthy), "{truthy}");
        }
        for falsy in ["false", "off", "0", "0.0", "", "unknown", "nan"] {
            assert!(!result_as_boolean(falsy), "{falsy}");
        }
    }

    #[test]
    fn test_is_template() {
        assert!(TemplateEngine::is_template("{{ foo }}"));
        assert!(TemplateEngine::is_template("{% if true %}{% endif %}"));
        assert!(!TemplateEngine::is_template("plain text"));
    }
}
