//! Core library for the Weft template dev engine.
//!
//! Weft watches a project tree for typed HTML template files, parses their
//! public component signatures into an in-memory catalogue, rebuilds changed
//! artifacts through an external compiler, and feeds change notifications to
//! whoever subscribes (in practice: the dev server's reload hub).
//!
//! The pipeline, leaves first:
//!
//! - [`paths`] confines every path to the project root and screens strings
//!   destined for the compiler command line,
//! - [`cache`] holds parsed-file metadata and build artifacts,
//! - [`registry`] owns the canonical component catalogue and fans out
//!   change events,
//! - [`scanner`] turns template files into [`component::Component`] records,
//! - [`watch`] debounces filesystem notifications into ordered batches,
//! - [`build`] runs compiles through a bounded, priority-aware worker pool,
//! - [`plugins`] lets external code transform components and hook builds.
//!
//! There is no global state: a [`project::Project`] handle is constructed at
//! startup and threaded through every constructor.

pub mod build;
pub mod cache;
pub mod component;
pub mod error;
pub mod paths;
pub mod plugins;
pub mod project;
pub mod registry;
pub mod scanner;
pub mod watch;

pub use component::{
    BuildPriority, BuildResult, BuildStatus, ChangeEvent, ChangeKind, Component, Diagnostic,
    Parameter, ParsedFile, RegistryEvent, Severity,
};
pub use error::{Result, WeftError};
pub use project::Project;
pub use registry::ComponentRegistry;
