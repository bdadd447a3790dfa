use std::sync::Arc;
use anyhow::{Context, Result};
use polybridge::{
    BridgeConfig, GcCallback, GcEvent, LanguageId, MemoryManager, Permissions, RegionFlags, RegionHandle,
    ShareFlags, VERSION,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Polybridge Memory Bridge v{}", VERSION);

    let config = BridgeConfig::from_env();
    info!(?config, "starting bridge");
    let bridge = MemoryManager::with_config(config).context("Failed to initialize the bridge")?;

    let python = LanguageId::new("python");
    let rust = LanguageId::new("rust");
    let cobol = LanguageId::new("cobol");

    // Allocate and share a region
    println!("\nAllocating a shared region...");
    let region = bridge.alloc_shared(1024, &python, RegionFlags::empty())?;
    bridge.write_bytes(region, &python, 0, b"hello from python")?;
    let shared = bridge.share(region, 1024, &python, &rust, ShareFlags::READ_ONLY)?;
    println!("Shared {} with {} (holders: {})", shared.handle, rust, bridge.ref_count(region));

    let greeting = bridge.read_bytes(region, &rust, 0, 17)?;
    println!("Rust reads: {}", String::from_utf8_lossy(&greeting));

    // Expose memory owned by another runtime
    let mut ledger = vec![0u8; 64];
    // SAFETY: `ledger` outlives its registration, which ends below
    let raw = unsafe { RegionHandle::from_raw(ledger.as_mut_ptr()) };
    let tracked = bridge.track_reference(raw, ledger.len(), &cobol)?;
    bridge.acquire(tracked, &rust, Permissions::READ | Permissions::WRITE)?;
    bridge.write_bytes(tracked, &rust, 0, b"PAID")?;
    bridge.synchronize(tracked, 4, &rust)?;
    bridge.release(tracked, &rust)?;
    println!("Tracked {} for {} (holders: {})", tracked, cobol, bridge.ref_count(tracked));

    // GC notifications
    let callback: GcCallback = Arc::new(|event: &GcEvent<'_>| {
        println!("GC pass started in {}", event.language);
    });
    bridge.register_gc_callback(Some(python.clone()), callback, None)?;
    match bridge.notify_gc(&python) {
        Ok(marked) => println!("Marked {} region(s) as in GC", marked),
        Err(e) => eprintln!("GC notification failed: {}", e),
    }

    // Snapshot and restore
    println!("\nSnapshotting the bridge...");
    let snapshot = bridge.create_snapshot(&python)?;
    let scratch = bridge.alloc_shared(256, &rust, RegionFlags::empty())?;
    let report = bridge.restore_snapshot(snapshot, &python)?;
    println!(
        "Restored {}: {} region(s) released, {} restored, scratch region present: {}",
        report.snapshot,
        report.released,
        report.remapped.len(),
        bridge.get_region_info(scratch).is_ok()
    );

    if let Some(restored) = report.resolve(region) {
        let bytes = bridge.read_bytes(restored, &python, 0, 17)?;
        println!("Restored region reads: {}", String::from_utf8_lossy(&bytes));
        bridge.free_shared(restored, &python)?;
    }
    // The ledger copy made by the restore is bridge-owned now
    if let Some(restored) = report.resolve(tracked) {
        bridge.free_shared(restored, &cobol)?;
    }
    drop(ledger);

    let stats = bridge.stats();
    println!("\nBridge stats: {:?}", stats);
    bridge.shutdown()?;
    Ok(())
}
