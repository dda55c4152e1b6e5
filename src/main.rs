// prunepool demo
// Shows a pruned pool healing itself after an expired lease, and a registry
// dropping the pool of a key that is no longer used.
//
// Run with: RUST_LOG=prunepool=debug cargo run

use prunepool::{
    EventLogger, FnFactory, KeyedPoolFactory, PoolConfiguration, PoolRegistry, PoolResult,
    PrunedPool, RegistryConfiguration, ResourceFactory,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> PoolResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== prunepool v{} ===", env!("CARGO_PKG_VERSION"));
    lease_expiry()?;
    registry_cleanup()?;
    Ok(())
}

fn lease_expiry() -> PoolResult<()> {
    let connections = Arc::new(AtomicU32::new(0));
    let factory = {
        let connections = Arc::clone(&connections);
        FnFactory::new(move || Ok(connections.fetch_add(1, Ordering::Relaxed) + 1))
    };
    let config = PoolConfiguration::new()
        .with_name("connections")
        .with_min_size(2)
        .with_max_size(4)
        .with_max_lease_time(Duration::from_millis(200))
        .with_prune_interval(Duration::from_millis(50))
        .with_interrupt_leaser(true);
    let pool = PrunedPool::new(config, factory)?;
    pool.events().add_listener(Arc::new(EventLogger::new()));
    pool.open()?;

    let forgotten = pool.acquire_timeout(Duration::from_secs(1))?;
    println!("  Leased connection {} and forgot about it", *forgotten);
    thread::sleep(Duration::from_millis(400));
    println!(
        "  Lease cancelled: {}, expired leases: {}, pool size: {}",
        forgotten.is_cancelled(),
        pool.lease_expired_count(),
        pool.size()
    );
    pool.release(forgotten);

    info!(metrics = ?pool.metrics().export(), "Pool metrics");
    pool.close();
    Ok(())
}

fn registry_cleanup() -> PoolResult<()> {
    let pools = PoolConfiguration::new()
        .with_name("host")
        .with_max_size(2)
        .with_max_idle_time(Duration::from_millis(50))
        .with_prune_interval(Duration::from_millis(25));
    let factory = KeyedPoolFactory::new(pools, |host: &&'static str| {
        let host = *host;
        Arc::new(FnFactory::new(move || Ok(format!("session@{host}")))) as Arc<dyn ResourceFactory<String>>
    });
    let config = RegistryConfiguration::new()
        .with_name("hosts")
        .with_clean_interval(Duration::from_millis(50));
    let registry = PoolRegistry::with_config(config, factory);
    registry.open()?;

    for host in ["alpha", "beta", "gamma"] {
        let session = registry.acquire(&host)?;
        println!("  Got {}", *session);
        registry.release(&host, session);
    }
    println!("  Pools in registry: {}", registry.pool_count());
    thread::sleep(Duration::from_millis(300));
    println!("  Pools after cleanup: {}", registry.pool_count());
    registry.close();
    Ok(())
}
