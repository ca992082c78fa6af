pub mod chat;
pub mod cross_encoder;
pub mod embeddings;
pub mod query_expand;
pub mod rerank;
