//! Programs: a named set of steps with one entry point.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::engine::codec::Structural;
use crate::engine::context::Context;
use crate::engine::error::{DefinitionError, Interrupt};
use crate::engine::step::{Args, Step, StepDefinition};

type ConfigFactory = Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

pub struct Program<R> {
    name: String,
    create_config: ConfigFactory,
    steps: Vec<Arc<StepDefinition>>,
    entry: Option<Step<R>>,
}

impl<R> fmt::Debug for Program<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("entry", &self.entry.as_ref().map(|e| e.definition().name.clone()))
            .finish()
    }
}

impl<R: Structural> Program<R> {
    /// A program whose runs each get a fresh value from `create_config`,
    /// readable by step bodies through [`Context::config`].
    pub fn new<C, F>(name: impl Into<String>, create_config: F) -> Self
    where
        C: Any + Send + Sync,
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            create_config: Arc::new(move || Arc::new(create_config()) as Arc<dyn Any + Send + Sync>),
            steps: Vec::new(),
            entry: None,
        }
    }

    /// A program without run-scoped configuration.
    pub fn unconfigured(name: impl Into<String>) -> Self {
        Self::new(name, || ())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered steps, in registration order. The entry is not included.
    pub fn steps(&self) -> &[Arc<StepDefinition>] {
        &self.steps
    }

    pub fn entry_definition(&self) -> Option<&Arc<StepDefinition>> {
        self.entry.as_ref().map(Step::definition)
    }

    fn check_unique(&self, name: &str) -> Result<(), DefinitionError> {
        let taken = self.steps.iter().any(|s| s.name == name)
            || self
                .entry_definition()
                .is_some_and(|entry| entry.name == name);
        if taken {
            return Err(DefinitionError::DuplicateStep {
                program: self.name.clone(),
                step: name.to_string(),
            });
        }
        Ok(())
    }

    /// Make `step` part of this program's documented surface.
    pub fn register<S: Structural>(&mut self, step: &Step<S>) -> Result<(), DefinitionError> {
        self.check_unique(step.name())?;
        self.steps.push(step.definition().clone());
        Ok(())
    }

    pub fn set_entry(&mut self, entry: Step<R>) -> Result<(), DefinitionError> {
        if self.entry.is_some() {
            return Err(DefinitionError::DuplicateEntry {
                program: self.name.clone(),
            });
        }
        self.check_unique(entry.name())?;
        self.entry = Some(entry);
        Ok(())
    }

    /// Bind `args` against the entry and run it under `cx`.
    ///
    /// The entry body is not numbered or cached itself; the steps it calls
    /// are numbered directly under the turn's scope.
    pub async fn run(&self, cx: &Context, args: Args) -> Result<R, Interrupt> {
        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| DefinitionError::MissingEntry {
                program: self.name.clone(),
            })?;
        let bound = entry.definition().bind(args)?;
        let _config = cx.install_config((self.create_config)());
        entry.run_body(cx, bound).await
    }
}
