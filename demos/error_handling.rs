//! Example demonstrating error handling patterns.
//!
//! This example shows how failures surface:
//! - Exceptions thrown by cell code
//! - Results with no JSON representation
//! - Deferred actions that throw, or outlive their cell
//! - Operations on a disposed session
//!
//! Run with: cargo run --example error_handling

use std::time::Duration;

use cellbox::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Error Handling Example ===\n");

    let session = SandboxSession::create(SandboxConfig::default()).await?;

    println!("--- Test 1: Thrown error ---");
    match session.eval_async("JSON.parse('{oops')").await {
        Err(SandboxError::EvaluationThrew { name, message, stack }) => {
            println!("  {name}: {message}");
            if let Some(stack) = stack {
                println!("  stack has {} lines", stack.lines().count());
            }
        }
        other => println!("  unexpected: {:?}", other),
    }

    println!("\n--- Test 2: Missing capability ---");
    if let Err(e) = session.eval_async("require('fs')").await {
        println!("  {e}");
    }

    println!("\n--- Test 3: Unrepresentable result ---");
    if let Err(e) = session.eval_async("1 / 0").await {
        println!("  {e} (materialization: {})", e.is_materialization());
    }

    println!("\n--- Test 4: Rejected promise ---");
    if let Err(e) = session
        .eval_async("new Promise((_, reject) => setTimeout(() => reject(new RangeError('late')), 10))")
        .await
    {
        println!("  {e}");
    }

    println!("\n--- Test 5: Deferred actions ---");
    let document = std::sync::Arc::new(Document::default());
    let evaluator = CellEvaluator::new(session.clone(), document)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let id = CellId::from("button");
    evaluator.subscribe(&id, move |result| {
        if let Ok(CellOutput::Action(action)) = result {
            let _ = tx.send(action.clone());
        }
    })?;
    evaluator.mount(CellSpec::new("button", "() => { throw new Error('clicked too hard') }"))?;
    if let Ok(Some(action)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        if let Err(e) = evaluator.invoke(&action).await {
            println!("  invoke: {e}");
        }
        evaluator.unmount(&id).await?;
        if let Err(e) = evaluator.invoke(&action).await {
            println!("  after unmount: {e}");
        }
    }

    println!("\n--- Test 6: Configuration error ---");
    let bad = SandboxConfig::builder().max_value_depth(0).build();
    if let Err(e) = SandboxSession::create(bad).await {
        println!("  {e}");
    }

    println!("\n--- Test 7: Disposed session ---");
    session.dispose().await;
    match session.eval_async("1").await {
        Err(e) if e.is_session_closed() => println!("  {e}"),
        other => println!("  unexpected: {:?}", other),
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
