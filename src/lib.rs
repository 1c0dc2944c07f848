//! MindMap Pro Learning API Library
//!
//! Backend for a study companion: accounts with JWT sessions, per-subject
//! knowledge maps, study and mistake logs, and the analyses built on them.
//!
//! # Modules
//!
//! - `api`: Route table and middleware stack.
//! - `analysis`: Study pattern analysis and score prediction.
//! - `auth`: Password hashing, tokens, login throttling.
//! - `cache_invalidator`: Dependency-aware cache invalidation.
//! - `cache_manager`: Checksummed TTL cache.
//! - `cache_validator`: Cache entry integrity checks.
//! - `config`: Configuration management.
//! - `db`: Database connection and schema.
//! - `db_storage`: Database storage operations.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `knowledge_map`: Concept graph, metrics and layout.
//! - `learning_analysis`: Study log reports.
//! - `manifest`: Dependency pin list checks.
//! - `migration`: User data export, import and backups.
//! - `mistake_pattern`: Mistake log reports.
//! - `models`: Core data models.
//! - `processor`: Session-level pattern summaries.

pub mod api;

pub mod analysis;
pub mod auth;
pub mod cache_invalidator;
pub mod cache_manager;
pub mod cache_validator;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod handlers;
pub mod knowledge_map;
pub mod learning_analysis;
pub mod manifest;
pub mod migration;
pub mod mistake_pattern;
pub mod models;
pub mod processor;
