//! The ordered step registry.
//!
//! The registry is the single source of pipeline order. The engine asks it for
//! prerequisites, output kinds and the next step; nothing else hardcodes order.

use crate::core::{OutputKind, StepName};
use crate::errors::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Definition of a single step in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// The step.
    pub name: StepName,
    /// The step that must be completed or skipped first.
    pub prerequisite: Option<StepName>,
    /// The kind of output the step stores.
    pub output_kind: OutputKind,
    /// Whether the step may be skipped.
    pub skippable: bool,
}

impl StepDefinition {
    /// Creates a non-skippable step definition with no prerequisite.
    #[must_use]
    pub fn new(name: StepName, output_kind: OutputKind) -> Self {
        Self {
            name,
            prerequisite: None,
            output_kind,
            skippable: false,
        }
    }

    /// Sets the prerequisite.
    #[must_use]
    pub fn after(mut self, prerequisite: StepName) -> Self {
        self.prerequisite = Some(prerequisite);
        self
    }

    /// Marks the step as skippable.
    #[must_use]
    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }
}

/// An immutable, validated, linear list of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRegistry {
    steps: Vec<StepDefinition>,
    order: Vec<StepName>,
}

impl StepRegistry {
    /// Returns the standard five-step pipeline.
    #[must_use]
    pub fn standard() -> Self {
        let steps = vec![
            StepDefinition::new(StepName::ExtractText, OutputKind::Text),
            StepDefinition::new(StepName::ExtractThemes, OutputKind::Themes)
                .after(StepName::ExtractText),
            StepDefinition::new(StepName::GenerateLesson, OutputKind::Lesson)
                .after(StepName::ExtractThemes),
            StepDefinition::new(StepName::ExtractCitations, OutputKind::Citations)
                .after(StepName::GenerateLesson)
                .skippable(),
            StepDefinition::new(StepName::GenerateAudio, OutputKind::Audio)
                .after(StepName::ExtractCitations)
                .skippable(),
        ];
        let order = steps.iter().map(|def| def.name).collect();
        Self { steps, order }
    }

    /// Creates a builder for a custom registry.
    #[must_use]
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    /// Returns the definition of a step.
    #[must_use]
    pub fn definition(&self, step: StepName) -> Option<&StepDefinition> {
        self.steps.iter().find(|def| def.name == step)
    }

    /// Returns the prerequisite of a step.
    ///
    /// `None` for the first step and for unregistered steps.
    #[must_use]
    pub fn prerequisite(&self, step: StepName) -> Option<StepName> {
        self.definition(step).and_then(|def| def.prerequisite)
    }

    /// Returns the step after `step`.
    #[must_use]
    pub fn next(&self, step: StepName) -> Option<StepName> {
        self.position(step)
            .and_then(|idx| self.order.get(idx + 1))
            .copied()
    }

    /// Returns the zero-based position of a step.
    #[must_use]
    pub fn position(&self, step: StepName) -> Option<usize> {
        self.order.iter().position(|name| *name == step)
    }

    /// Returns the steps in pipeline order.
    #[must_use]
    pub fn steps(&self) -> &[StepName] {
        &self.order
    }

    /// Returns the first step.
    #[must_use]
    pub fn first(&self) -> Option<StepName> {
        self.order.first().copied()
    }

    /// Returns true if the step is registered.
    #[must_use]
    pub fn contains(&self, step: StepName) -> bool {
        self.position(step).is_some()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if there are no steps. A built registry never is.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the first registered step producing `kind`.
    #[must_use]
    pub fn producer_of(&self, kind: OutputKind) -> Option<StepName> {
        self.steps
            .iter()
            .find(|def| def.output_kind == kind)
            .map(|def| def.name)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Builder for a validated [`StepRegistry`].
#[derive(Debug, Clone, Default)]
pub struct StepRegistryBuilder {
    steps: Vec<StepDefinition>,
}

impl StepRegistryBuilder {
    /// Appends a step.
    #[must_use]
    pub fn step(mut self, definition: StepDefinition) -> Self {
        self.steps.push(definition);
        self
    }

    /// Validates and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is empty, a step appears twice, or a
    /// prerequisite is not the immediately preceding step.
    pub fn build(self) -> Result<StepRegistry, RegistryError> {
        if self.steps.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut seen = HashSet::new();
        let mut previous = None;
        for def in &self.steps {
            if !seen.insert(def.name) {
                return Err(RegistryError::DuplicateStep(def.name));
            }
            if def.prerequisite != previous {
                return Err(RegistryError::BrokenChain {
                    step: def.name,
                    expected: previous,
                    declared: def.prerequisite,
                });
            }
            previous = Some(def.name);
        }

        let order = self.steps.iter().map(|def| def.name).collect();
        Ok(StepRegistry {
            steps: self.steps,
            order,
        })
    }
}
