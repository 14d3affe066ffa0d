//! Basic example of evaluating cells embedded in a document.
//!
//! Mounts two cells, edits the document, and shows which cells re-run.
//!
//! Run with: cargo run --example basic_cells

use std::sync::Arc;
use std::time::Duration;

use cellbox::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Basic Cells Example ===\n");

    let document = Arc::new(Document::new(vec![
        Node::element("heading", vec![Node::text("Notes")]),
        Node::element("code_block", vec![Node::cell("where", "here()")]),
        Node::element("code_block", vec![Node::cell("sum", "[1, 2, 3].reduce((a, b) => a + b)")]),
    ]));

    let config = SandboxConfig::builder()
        .max_memory(32 * 1024 * 1024)
        .thread_name("basic-cells")
        .build();
    let session = SandboxSession::create(config).await?;
    let evaluator = CellEvaluator::new(session, document.clone())?;
    evaluator.follow(document.subscribe());

    for id in ["where", "sum", "greet"] {
        evaluator.subscribe(&CellId::from(id), move |result| match result {
            Ok(CellOutput::Value(value)) => println!("  {id} = {value}"),
            Ok(CellOutput::Action(_)) => println!("  {id} returned an action"),
            Err(e) => println!("  {id} failed: {e}"),
        })?;
    }

    println!("--- Mounting cells ---");
    evaluator.mount(CellSpec::new("where", "here()"))?;
    evaluator.mount(CellSpec::new("sum", "[1, 2, 3].reduce((a, b) => a + b)"))?;
    evaluator.mount(CellSpec::new(
        "greet",
        "() => console.log('hello from a deferred action')",
    ))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // "where" read its location, so it re-runs on every edit.
    println!("\n--- Inserting a paragraph at the top ---");
    document.insert(0, Node::element("paragraph", vec![Node::text("Draft")]));
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n--- Changing a cell's code ---");
    evaluator.update_source(&CellId::from("sum"), "[1, 2, 3, 4].reduce((a, b) => a + b)")?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n--- Session scope ---");
    let out = evaluator
        .session()
        .eval_async("_internals.formatDateTime('2024-03-05T14:30:00Z', 'en-US', {dateStyle: 'full', timeZone: 'UTC'})")
        .await?;
    println!("  formatted: {:?}", out.value());

    let stats = evaluator.session().stats().await?;
    println!("\nSession stats: {:?}", stats);

    evaluator.dispose().await;
    println!("\n=== Example Complete ===");
    Ok(())
}
