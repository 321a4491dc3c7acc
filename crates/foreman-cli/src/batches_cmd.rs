//! `foreman batches` command: list every batch with its progress summary.

use anyhow::Result;
use sqlx::SqlitePool;

use foreman_db::queries::batches as batch_db;

pub async fn run_batches(pool: &SqlitePool) -> Result<()> {
    let batches = batch_db::list_batches(pool).await?;
    if batches.is_empty() {
        println!("No batches.");
        return Ok(());
    }

    println!("{:<20} {:<10} {:>6} {:>10} {:>10} {:>10}", "ID", "STATUS", "CONC", "COMPLETE", "FAILED", "IN-FLIGHT");
    println!("{}", "-".repeat(70));
    for batch in &batches {
        let progress = batch_db::get_batch_progress(pool, &batch.id).await?;
        println!(
            "{:<20} {:<10} {:>6} {:>10} {:>10} {:>10}",
            batch.id, batch.status, batch.base_concurrency, progress.complete_or_better, progress.failed_or_blocked, progress.in_flight,
        );
    }

    Ok(())
}
