pub mod bm25;
pub mod hybrid;
pub mod qdrant;
pub mod vector;
