//! Async usage examples

use prunepool::{FnFactory, PoolConfiguration, PrunedPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() {
    println!("=== prunepool - Async Examples ===\n");

    // Example 1: Async acquire
    async_acquire().await;

    // Example 2: Async with timeout
    async_with_timeout().await;

    // Example 3: Concurrent access
    concurrent_access().await;
}

fn counting_pool(max_size: usize) -> PrunedPool<u32> {
    let next = Arc::new(AtomicU32::new(0));
    let config = PoolConfiguration::new()
        .with_max_size(max_size)
        .with_acquire_timeout(Duration::from_secs(1));
    let pool = PrunedPool::new(
        config,
        FnFactory::new(move || Ok(next.fetch_add(1, Ordering::Relaxed))),
    )
    .unwrap();
    pool.open().unwrap();
    pool
}

async fn async_acquire() {
    println!("1. Async Acquire:");
    let pool = counting_pool(2);

    let resource = pool.acquire_async(Duration::from_millis(100)).await.unwrap();
    println!("   Got resource asynchronously: {}", *resource);
    pool.release(resource);

    pool.close();
    println!();
}

async fn async_with_timeout() {
    println!("2. Async with Timeout:");
    let pool = counting_pool(1);

    // Take the only resource
    let held = pool.acquire_async(Duration::from_millis(100)).await.unwrap();

    // Try to get another (should time out)
    match pool.acquire_async(Duration::from_millis(100)).await {
        Ok(_) => println!("   Got resource"),
        Err(e) => println!("   Error: {}", e),
    }
    pool.release(held);

    pool.close();
    println!();
}

async fn concurrent_access() {
    println!("3. Concurrent Access:");
    let pool = counting_pool(3);

    let mut handles = vec![];
    for task in 0..6 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let resource = pool.acquire_async(Duration::from_secs(1)).await.unwrap();
            sleep(Duration::from_millis(20)).await;
            println!("   Task {} used resource {}", task, *resource);
            pool.release(resource);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    println!("   Resources created: {}", pool.created_count());
    pool.close();
    println!();
}
