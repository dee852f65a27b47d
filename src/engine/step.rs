//! Steps: named, schema-typed, cacheable units of work.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::engine::codec::{self, Schema, Structural};
use crate::engine::context::Context;
use crate::engine::error::{BindError, DefinitionError, Interrupt};

/// A declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub schema: Schema,
    /// Encoded default applied when the argument is not supplied.
    pub default: Option<Value>,
}

/// Immutable description of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub doc: String,
    pub params: Vec<Param>,
    pub returns: Schema,
}

impl StepDefinition {
    /// Match `args` against the declared parameters.
    ///
    /// Positional arguments fill parameters in declaration order, named ones
    /// fill by name, and declared defaults cover the rest.
    pub fn bind(&self, args: Args) -> Result<BoundArgs, BindError> {
        if let Some(err) = args.error {
            return Err(err);
        }
        if args.positional.len() > self.params.len() {
            return Err(BindError::TooManyPositional {
                step: self.name.clone(),
                expected: self.params.len(),
                got: args.positional.len(),
            });
        }

        let mut slots: Vec<Option<Value>> = vec![None; self.params.len()];
        for (slot, value) in slots.iter_mut().zip(args.positional) {
            *slot = Some(value);
        }
        for (name, value) in args.named {
            let idx = self
                .params
                .iter()
                .position(|param| param.name == name)
                .ok_or_else(|| BindError::UnknownParameter {
                    step: self.name.clone(),
                    name: name.clone(),
                })?;
            if slots[idx].is_some() {
                return Err(BindError::DuplicateArgument {
                    step: self.name.clone(),
                    name,
                });
            }
            slots[idx] = Some(value);
        }

        let mut values = Vec::with_capacity(self.params.len());
        for (param, slot) in self.params.iter().zip(slots) {
            let value = match slot.or_else(|| param.default.clone()) {
                Some(value) => value,
                None => {
                    return Err(BindError::MissingArgument {
                        step: self.name.clone(),
                        name: param.name.clone(),
                    })
                }
            };
            param
                .schema
                .validate(&value)
                .map_err(|source| BindError::InvalidArgument {
                    step: self.name.clone(),
                    name: param.name.clone(),
                    source,
                })?;
            values.push((param.name.clone(), value));
        }

        Ok(BoundArgs {
            step: self.name.clone(),
            values,
        })
    }

    /// Parameters as a JSON-schema object.
    pub fn request_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let mut schema = param.schema.json_schema();
            match (&param.default, schema.as_object_mut()) {
                (Some(default), Some(object)) => {
                    object.insert("default".to_string(), default.clone());
                }
                (Some(_), None) => {}
                (None, _) => required.push(Value::String(param.name.clone())),
            }
            properties.insert(param.name.clone(), schema);
        }
        serde_json::json!({
            "title": request_title(&self.name),
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn request_title(name: &str) -> String {
    let mut title: String = name
        .split(['_', '-'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    title.push_str("Request");
    title
}

/// Arguments supplied to a step or program, before binding.
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
    error: Option<BindError>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize>(mut self, value: T) -> Self {
        let position = self.positional.len();
        match serde_json::to_value(value) {
            Ok(value) => self.positional.push(value),
            Err(err) => self.fail(format!("#{position}"), err),
        }
        self
    }

    pub fn named<T: Serialize>(mut self, name: impl Into<String>, value: T) -> Self {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => self.named.push((name, value)),
            Err(err) => self.fail(name, err),
        }
        self
    }

    /// Named arguments from a JSON object.
    pub fn from_json(object: Map<String, Value>) -> Self {
        Self {
            named: object.into_iter().collect(),
            ..Self::default()
        }
    }

    fn fail(&mut self, name: String, err: serde_json::Error) {
        if self.error.is_none() {
            self.error = Some(BindError::Unserializable {
                name,
                reason: err.to_string(),
            });
        }
    }
}

/// Arguments matched against a step's parameters, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundArgs {
    step: String,
    values: Vec<(String, Value)>,
}

impl BoundArgs {
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find_map(|(param, value)| (param == name).then_some(value))
    }

    /// Decode the argument bound to `name`.
    pub fn get<T: Structural>(&self, name: &str) -> Result<T, BindError> {
        let value = self.raw(name).ok_or_else(|| BindError::MissingArgument {
            step: self.step.clone(),
            name: name.to_string(),
        })?;
        codec::decode_value(value.clone()).map_err(|source| BindError::InvalidArgument {
            step: self.step.clone(),
            name: name.to_string(),
            source,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// The bound record as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.iter().cloned().collect())
    }
}

type AsyncBody<R> =
    Arc<dyn Fn(Context, BoundArgs) -> BoxFuture<'static, Result<R, Interrupt>> + Send + Sync>;
type SyncBody<R> = Arc<dyn Fn(&Context, &BoundArgs) -> Result<R, Interrupt> + Send + Sync>;

enum Body<R> {
    Async(AsyncBody<R>),
    Sync(SyncBody<R>),
}

impl<R> Clone for Body<R> {
    fn clone(&self) -> Self {
        match self {
            Body::Async(body) => Body::Async(body.clone()),
            Body::Sync(body) => Body::Sync(body.clone()),
        }
    }
}

/// A step definition paired with the computation it wraps.
///
/// Calling a step goes through the cache interceptor: the call is numbered in
/// the current scope, the context's [`StepHooks`] may answer it from the cache
/// (the body then never runs), and a fresh result is handed back to the hooks
/// for recording.
///
/// [`StepHooks`]: crate::engine::StepHooks
pub struct Step<R> {
    definition: Arc<StepDefinition>,
    body: Body<R>,
}

impl<R> Clone for Step<R> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            body: self.body.clone(),
        }
    }
}

impl<R> fmt::Debug for Step<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}

impl Step<()> {
    pub fn builder(name: impl Into<String>) -> StepBuilder {
        StepBuilder::new(name)
    }
}

impl<R> Step<R> {
    pub fn definition(&self) -> &Arc<StepDefinition> {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl<R: Structural> Step<R> {
    /// Bind `args` and invoke through the cache interceptor.
    pub async fn call(&self, cx: &Context, args: Args) -> Result<R, Interrupt> {
        let bound = self.definition.bind(args)?;
        self.invoke(cx, bound).await
    }

    pub async fn invoke(&self, cx: &Context, bound: BoundArgs) -> Result<R, Interrupt> {
        let _call = cx.scope().enter();

        let Some(hooks) = cx.hooks() else {
            return self.run_body(cx, bound).await;
        };

        let call_id = cx.scope().current_id()?;
        if let Some(cached) = hooks.lookup(&call_id)? {
            tracing::debug!(step = %self.definition.name, call_id = %call_id, "step cache hit");
            return Ok(codec::decode(&self.definition.returns, cached)?);
        }

        let span = tracing::debug_span!("step", step = %self.definition.name, call_id = %call_id);
        let result = self.run_body(cx, bound.clone()).instrument(span).await?;
        let encoded = codec::encode(&self.definition.returns, &result)?;
        hooks.complete(&call_id, &self.definition, &bound, encoded);
        Ok(result)
    }

    /// Run the wrapped computation directly, bypassing numbering and caching.
    pub(crate) async fn run_body(&self, cx: &Context, bound: BoundArgs) -> Result<R, Interrupt> {
        match &self.body {
            Body::Async(body) => body(cx.clone(), bound).await,
            Body::Sync(body) => body(cx, &bound),
        }
    }
}

/// Declares a step's documentation and parameters, then attaches its body.
#[derive(Debug)]
pub struct StepBuilder {
    name: String,
    doc: Option<String>,
    params: Vec<Param>,
    error: Option<DefinitionError>,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: None,
            params: Vec::new(),
            error: None,
        }
    }

    pub fn doc(mut self, doc: impl AsRef<str>) -> Self {
        self.doc = Some(clean_doc(doc.as_ref()));
        self
    }

    /// A required parameter of type `T`.
    pub fn param<T: Structural>(self, name: impl Into<String>) -> Self {
        self.param_schema(name, T::schema(), None)
    }

    /// A parameter of type `T` that defaults to `default`.
    pub fn param_or<T: Structural>(mut self, name: impl Into<String>, default: T) -> Self {
        let name = name.into();
        match codec::encode_value(&default) {
            Ok(encoded) => self.param_schema(name, T::schema(), Some(encoded)),
            Err(source) => {
                self.record(DefinitionError::InvalidDefault {
                    step: self.name.clone(),
                    param: name,
                    source,
                });
                self
            }
        }
    }

    pub fn param_schema(
        mut self,
        name: impl Into<String>,
        schema: Schema,
        default: Option<Value>,
    ) -> Self {
        self.params.push(Param {
            name: name.into(),
            schema,
            default,
        });
        self
    }

    fn record(&mut self, err: DefinitionError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Validate the declaration against the return type `returns`.
    pub fn finish(self, returns: Schema) -> Result<StepDefinition, DefinitionError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let doc = match self.doc {
            Some(doc) if !doc.is_empty() => doc,
            _ => {
                return Err(DefinitionError::MissingDocumentation { step: self.name });
            }
        };

        for (idx, param) in self.params.iter().enumerate() {
            if self.params[..idx].iter().any(|p| p.name == param.name) {
                return Err(DefinitionError::DuplicateParameter {
                    step: self.name,
                    param: param.name.clone(),
                });
            }
            param
                .schema
                .check_well_formed()
                .map_err(|reason| DefinitionError::InvalidSchema {
                    step: self.name.clone(),
                    subject: format!("parameter `{}`", param.name),
                    reason,
                })?;
            if let Some(default) = &param.default {
                param
                    .schema
                    .validate(default)
                    .map_err(|source| DefinitionError::InvalidDefault {
                        step: self.name.clone(),
                        param: param.name.clone(),
                        source,
                    })?;
            }
        }
        returns
            .check_well_formed()
            .map_err(|reason| DefinitionError::InvalidSchema {
                step: self.name.clone(),
                subject: "the return value".to_string(),
                reason,
            })?;

        Ok(StepDefinition {
            name: self.name,
            doc,
            params: self.params,
            returns,
        })
    }

    /// Attach a suspending body.
    pub fn build<R, F, Fut>(self, body: F) -> Result<Step<R>, DefinitionError>
    where
        R: Structural,
        F: Fn(Context, BoundArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Interrupt>> + Send + 'static,
    {
        let definition = self.finish(R::schema())?;
        Ok(Step {
            definition: Arc::new(definition),
            body: Body::Async(Arc::new(move |cx, args| body(cx, args).boxed())),
        })
    }

    /// Attach a synchronous body.
    pub fn build_sync<R, F>(self, body: F) -> Result<Step<R>, DefinitionError>
    where
        R: Structural,
        F: Fn(&Context, &BoundArgs) -> Result<R, Interrupt> + Send + Sync + 'static,
    {
        let definition = self.finish(R::schema())?;
        Ok(Step {
            definition: Arc::new(definition),
            body: Body::Sync(Arc::new(body)),
        })
    }
}

/// Strip common indentation and surrounding blank lines.
fn clean_doc(doc: &str) -> String {
    let lines: Vec<&str> = doc.lines().collect();
    let indent = lines
        .iter()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    let cleaned: Vec<&str> = lines
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            if idx == 0 || line.trim().is_empty() {
                line.trim()
            } else {
                line.get(indent..).unwrap_or_else(|| line.trim_start()).trim_end()
            }
        })
        .collect();

    let start = cleaned.iter().position(|line| !line.is_empty());
    let end = cleaned.iter().rposition(|line| !line.is_empty());
    match (start, end) {
        (Some(start), Some(end)) => cleaned[start..=end].join("\n"),
        _ => String::new(),
    }
}
