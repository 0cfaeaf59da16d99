//! `gantry` - issue tracker with an external-project migration engine
//!
//! This crate provides the core functionality for the `gantry` CLI tool:
//! a lightweight issue tracker whose centerpiece is a one-shot import
//! pipeline that migrates a whole project (issues, comments, attachments,
//! links, users, labels, releases) out of a remote Jira-style tracker and
//! into the local `SQLite` data model.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`cli`] - Command-line interface using clap
//! - [`model`] - Target-side data types (Issue, Comment, User, ...)
//! - [`remote`] - Remote tracker API boundary and HTTP client
//! - [`import`] - The migration engine (staging, mappers, pipeline,
//!   attachment transfer, transactional commit, registry)
//! - [`storage`] - `SQLite` database layer
//! - [`blob`] - Object storage boundary for attachment/avatar bytes
//! - [`notify`] - Fire-and-forget notification boundary
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blob;
pub mod cli;
pub mod config;
pub mod error;
pub mod import;
pub mod logging;
pub mod model;
pub mod notify;
pub mod remote;
pub mod storage;

pub use error::{GantryError, Result};
