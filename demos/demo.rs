//! Incremental build demo showing cold, warm, edited and failing runs.
//!
//! Run with: cargo run --example demo
//!
//! Set `RUST_LOG=recall=debug` to see every reuse decision.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use recall::{BoxError, CellOutcome, Ctx, Logged, Recall, RecallConfig, RunReport};
use thiserror::Error;

// ============================================================================
// Sources and errors
// ============================================================================

/// The "file system" the build reads from. Edited between scenarios.
#[derive(Debug, Clone, Default)]
struct Sources(Arc<Mutex<BTreeMap<String, String>>>);

impl Sources {
    fn write(&self, path: &str, contents: &str) {
        self.0.lock().insert(path.to_string(), contents.to_string());
    }

    fn read(&self, path: &str) -> Option<String> {
        self.0.lock().get(path).cloned()
    }

    fn paths(&self) -> Vec<String> {
        self.0.lock().keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Error)]
enum BuildError {
    #[error("{0}: no such file")]
    Missing(String),
    #[error("{path}: syntax error on line {line}")]
    Syntax { path: String, line: usize },
}

// ============================================================================
// Build graph
// ============================================================================

/// `read/<path>` -> `compile/<path>` -> `link`
async fn build(ctx: Ctx, sources: Sources) -> Result<usize, BoxError> {
    let objects: Vec<Logged<usize>> = sources
        .paths()
        .into_iter()
        .map(|path| {
            let text = ctx.log(format!("read/{path}"), {
                let sources = sources.clone();
                let path = path.clone();
                move |_| async move {
                    sources
                        .read(&path)
                        .ok_or_else(|| BoxError::from(BuildError::Missing(path)))
                }
            });

            ctx.log(format!("compile/{path}"), move |ctx| async move {
                let text: String = ctx.read(&text).await?;
                println!("  [compile] {path}");
                tokio::time::sleep(Duration::from_millis(100)).await;

                if let Some(line) = text.lines().position(|l| l.contains("@@")) {
                    let err = BuildError::Syntax {
                        path,
                        line: line + 1,
                    };
                    return Err::<usize, BoxError>(err.into());
                }
                Ok::<_, BoxError>(text.split_whitespace().count())
            })
        })
        .collect();

    let link = ctx.log("link", move |ctx| async move {
        let mut total = 0;
        for object in &objects {
            total += ctx.read(object).await?;
        }
        println!("  [link] {} objects", objects.len());
        Ok::<_, BoxError>(total)
    });

    Ok(ctx.read(&link).await?)
}

fn summarize(report: &RunReport) {
    let count = |outcome: CellOutcome| {
        report
            .cells
            .iter()
            .filter(|cell| cell.outcome == outcome)
            .count()
    };
    println!(
        "    executed: {}, reused: {}, failed: {}, cancelled: {} ({} ms)",
        count(CellOutcome::Executed),
        count(CellOutcome::Reused),
        count(CellOutcome::Failed),
        count(CellOutcome::Cancelled),
        report.duration_ms().unwrap_or_default(),
    );
}

async fn scenario(recall: &Recall, sources: &Sources, title: &str) {
    println!("┌──────────────────────────────────────────────────────────────┐");
    println!("│ {:<60} │", title);
    println!("└──────────────────────────────────────────────────────────────┘\n");

    let sources = sources.clone();
    let (result, report) = recall
        .run_with_report(|ctx| build(ctx, sources))
        .await;

    match result {
        Ok(words) => println!("\n  ✓ Build succeeded: {} words", words),
        Err(err) => println!("\n  ✗ {}", err),
    }
    summarize(&report);
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recall=info".into()),
        )
        .init();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           Recall Incremental Build Demo                      ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let dir = std::env::temp_dir().join(format!("recall-demo-{}", std::process::id()));
    let recall = Recall::open(RecallConfig::new(&dir))?;

    let sources = Sources::default();
    sources.write("main.src", "fn main calls util and prints");
    sources.write("util.src", "fn util returns forty two");
    sources.write("extra.src", "fn extra is never called");

    scenario(&recall, &sources, "Scenario 1: Cold build - everything compiles").await;
    scenario(&recall, &sources, "Scenario 2: Warm build - nothing changed").await;

    sources.write("util.src", "fn util returns forty three");
    scenario(&recall, &sources, "Scenario 3: Edit one file - one recompile").await;

    sources.write("main.src", "fn main @@ broken");
    scenario(&recall, &sources, "Scenario 4: Syntax error - build fails").await;

    sources.write("main.src", "fn main calls util and prints");
    scenario(&recall, &sources, "Scenario 5: Fix restores the cached build").await;

    recall.close().await?;
    std::fs::remove_dir_all(&dir)?;

    println!("✓ All demos completed!");
    Ok(())
}
