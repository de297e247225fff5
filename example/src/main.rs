use mnemo_rs::block::DraftBlock;
use mnemo_rs::config::MemoryConfig;
use mnemo_rs::coordinator::MemoryCoordinator;
use mnemo_rs::error::MResult;

fn main() {
    println!("Hello, mnemo!");

    run().unwrap();

    println!("Bye~");
}

fn run() -> MResult<()> {
    let storage_root = tempdir::TempDir::new("mnemo-example")
        .expect("temp dir")
        .path()
        .join("store");

    let config = MemoryConfig {
        summary_dim: 4,
        lsh_seed: Some(7),
        storage_root: Some(storage_root),
        ..MemoryConfig::default()
    };
    let mut memory = MemoryCoordinator::new(config)?;

    // Two facts with distinct summaries.
    let sky = DraftBlock {
        concept_key: "fact:sky_color=blue".to_string(),
        ..DraftBlock::default()
    };
    let sky = memory.insert_with_summary(sky, vec![1.0, 0.0, 0.0, 0.0])?.id();

    let grass = DraftBlock {
        concept_key: "fact:grass_color=green".to_string(),
        ..DraftBlock::default()
    };
    memory.insert_with_summary(grass, vec![0.0, 1.0, 0.0, 0.0])?;

    // Nearest-neighbor retrieval.
    let hits = memory.query(&[1.0, 0.0, 0.0, 0.0], 1);
    assert_eq!(hits[0].id, sky);
    println!("query hit: block {} (similarity {:.3})", hits[0].id, hits[0].similarity);

    // Correct the fact, then change our mind.
    let corrected = DraftBlock {
        concept_key: "fact:sky_color=blue".to_string(),
        summary: Some(vec![0.9, 0.1, 0.0, 0.0]),
        ..DraftBlock::default()
    };
    let v2 = memory.update_concept(corrected, "saw a sunset", 0.1)?;
    println!("updated fact to block {}", v2);
    memory.rollback("fact:sky_color=blue", "it was a one-off")?;
    assert_eq!(memory.current("fact:sky_color=blue").unwrap().node_id, sky);

    memory.sync()?;
    println!("stats: {:?}", memory.stats());

    Ok(())
}
