//! Simple round trip against a running cache server

use artifact_cache::client::{download, upload};
use artifact_cache::{ArtifactKey, ClientEngine, ClientError, Digest};
use std::io;

fn main() -> Result<(), ClientError> {
    println!("Connecting to cache server at 127.0.0.1:9966...");
    let mut engine = ClientEngine::connect("127.0.0.1:9966", "artifact-cache", "demo")?;

    // Test 1: Put a small artifact
    println!("\nTest 1: Put");
    let key = ArtifactKey::new(Digest::from_bytes([0u8; 32]), 0);
    let body = b"hello";
    engine.put(&key, body.len() as u64, &mut &body[..])?;
    println!("  Stored {} ({} bytes)", key, body.len());

    // Test 2: Get it back
    println!("\nTest 2: Get");
    let mut data = Vec::new();
    let size = engine.get(&key, &mut data)?;
    println!("  Size: {:?}", size);
    println!("  Data: {}", String::from_utf8_lossy(&data));
    println!("  Matches: {}", data == body);

    // Test 3: Get a key that was never written
    println!("\nTest 3: Miss");
    let missing = ArtifactKey::new(Digest::from_bytes([0xFF; 32]), 0);
    let size = engine.get(&missing, &mut io::sink())?;
    println!("  Found: {}", size.is_some());

    // Test 4: Random entity with verification
    println!("\nTest 4: Upload and verify");
    let mut rng = rand::thread_rng();
    let entity = upload(&mut engine, &mut rng)?;
    let report = download(&mut engine, &entity, true)?;
    println!("  Id: {}", entity.id);
    println!("  Hits: {}, misses: {}, bytes: {}", report.hits, report.misses, report.bytes);

    engine.close()?;
    println!("\nAll tests passed!");
    Ok(())
}
