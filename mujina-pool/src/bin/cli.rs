//! Command-line interface for mujina-pool.
//!
//! Queries a running pool coordinator over its HTTP API.

use std::env;

use anyhow::Result;

use mujina_pool::api_client;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("status") => cmd_status().await?,
        Some("worker") => match args.get(2) {
            Some(address) => cmd_worker(address).await?,
            None => {
                eprintln!("Usage: mujina-pool-cli worker <address>");
                std::process::exit(1);
            }
        },
        Some(command) => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
        None => {
            eprintln!("Usage: mujina-pool-cli <command>");
            eprintln!();
            eprintln!("Commands:");
            eprintln!("  status              Show pool statistics and recent blocks");
            eprintln!("  worker <address>    Show a worker's statistics and payments");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  MUJINA_POOL_API_URL    API base URL (default: http://127.0.0.1:8080)");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Build an API client, honoring MUJINA_POOL_API_URL if set.
fn make_client() -> api_client::Client {
    match env::var("MUJINA_POOL_API_URL") {
        Ok(url) => api_client::Client::with_base_url(url),
        Err(_) => api_client::Client::new(),
    }
}

/// Print pool totals and the latest blocks.
async fn cmd_status() -> Result<()> {
    let client = make_client();
    let stats = client.get_stats().await?;

    println!("Uptime:    {} s", stats.uptime_secs);
    println!("Workers:   {} ({} active)", stats.total_workers, stats.active_workers);
    println!("Hashrate:  {:.0} H/s", stats.hashrate);
    println!("Blocks:    {}", stats.blocks_found);
    println!("Paid:      {:.8}", stats.total_paid);
    println!("Pending:   {:.8}", stats.pending_balance);
    match stats.work_age_secs {
        Some(age) => println!("Work age:  {} s", age),
        None => println!("Work age:  (no work)"),
    }

    let blocks = client.get_blocks(5).await?;
    if !blocks.is_empty() {
        println!("Recent blocks:");
        for block in &blocks {
            println!(
                "  - {} {} by {} ({:.8})",
                block.height, block.hash, block.finder, block.reward
            );
        }
    }

    Ok(())
}

/// Print one worker's statistics and payment history.
async fn cmd_worker(address: &str) -> Result<()> {
    let client = make_client();
    let worker = client.get_worker(address).await?;

    println!("Address:   {}", worker.address);
    println!(
        "Shares:    {} ({} valid, {} invalid)",
        worker.total_shares, worker.valid_shares, worker.invalid_shares
    );
    println!("Hashrate:  {:.0} H/s", worker.hashrate);
    println!("Pending:   {:.8}", worker.pending_balance);
    println!("Paid:      {:.8}", worker.total_paid);

    let payments = client.get_worker_payments(address).await?;
    if payments.is_empty() {
        println!("Payments:  (none)");
    } else {
        println!("Payments:");
        for p in &payments {
            println!(
                "  - block {} {:.8} {} {}",
                p.block_height,
                p.amount,
                p.status,
                p.txid.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(())
}
