//! Murmur DB - PostgreSQL persistence for the job queue and content tables.
//!
//! This crate provides the repository layer behind the queue engine, using
//! pgvector for embeddings and semantic search.
//!
//! # Overview
//!
//! The main components are:
//! - [`JobRepository`] - durable job queue with atomic `SKIP LOCKED` batch claiming
//! - [`ContentRepository`] - posts and comments: content scan, text loading,
//!   enrichment persistence and vector search
//! - [`run_migrations`] - idempotent schema setup

mod content_repository;
mod job_repository;
mod schema;

pub use content_repository::ContentRepository;
pub use job_repository::JobRepository;
pub use schema::{EMBEDDING_DIMENSION, MIGRATIONS, run_migrations};
