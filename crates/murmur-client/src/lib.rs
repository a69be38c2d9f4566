//! Murmur Client - HTTP clients for external APIs
//!
//! This crate provides the [`openai`] client, which talks to an
//! OpenAI-compatible API for two jobs:
//!
//! - text embeddings, through [`murmur_core::traits::EmbeddingProvider`]
//! - topic, location and tag extraction, through [`murmur_core::traits::EntityExtractor`]
//!
//! # Overview
//!
//! The client handles authentication, request building, response parsing,
//! and classifies every failure into the core error taxonomy.

pub mod openai;

pub use openai::OpenAIClient;
