//! `mnemo-rs` is an associative memory layer for transformer inference
//! runtimes. It sublimates per-sequence KV-cache state into durable,
//! content-addressed memory blocks, deduplicates arrivals against prior
//! blocks (bloom → exact key → LSH), tracks each conceptual fact's version
//! history with supersede/retract/merge/rollback semantics, and maintains
//! a correlation graph whose edges are reinforced on co-retrieval and
//! decayed over time. Retrieval stays sub-linear in the number of stored
//! blocks: candidate lookup goes through the LSH tables and fans out one
//! hop across strong correlation edges.
//!
//! ## Getting started
//!
//! ```rust
//! use mnemo_rs::block::DraftBlock;
//! use mnemo_rs::config::MemoryConfig;
//! use mnemo_rs::coordinator::MemoryCoordinator;
//! use mnemo_rs::error::MResult;
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> MResult<()> {
//!     let config = MemoryConfig {
//!         summary_dim: 4,
//!         lsh_seed: Some(7),
//!         ..MemoryConfig::default()
//!     };
//!     let mut memory = MemoryCoordinator::new(config)?;
//!
//!     let draft = DraftBlock {
//!         concept_key: "fact:sky_color=blue".to_string(),
//!         ..DraftBlock::default()
//!     };
//!     let inserted = memory.insert_with_summary(draft, vec![1.0, 0.0, 0.0, 0.0])?;
//!
//!     let hits = memory.query(&[1.0, 0.0, 0.0, 0.0], 1);
//!     assert_eq!(hits[0].id, inserted.id());
//!     assert!(hits[0].similarity >= 0.999);
//!
//!     memory.retract("fact:sky_color=blue", "example over")?;
//!     assert!(memory.query(&[1.0, 0.0, 0.0, 0.0], 1).is_empty());
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod graph;
pub mod hash;
pub mod persist;
pub mod sublimate;
pub mod version;
