//! Testing utilities for lessonflow pipelines.
//!
//! This module provides:
//! - Scripted step operations with call counting
//! - Fake collaborators for the lesson pipeline

mod mocks;

pub use mocks::{
    FakeNarrationSynthesizer, FakeStructuredGenerator, FakeTextExtractor, InMemoryAudioSink,
    ScriptedOperation,
};
