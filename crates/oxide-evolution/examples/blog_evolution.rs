//! Example: Blog Application Evolution
//!
//! This example walks a blog application through three versions of its
//! models: hinted evolutions for the first two, an authored rename for the
//! third.
//!
//! Run with: cargo run --example blog_evolution -p oxide-evolution

use oxide_evolution::prelude::*;
use oxide_evolution::OxideEvolution;

// =============================================================================
// Declared Models
// =============================================================================

fn user() -> ModelSignature {
    ModelSignature::new("User")
        .field(FieldSignature::new("id", FieldType::BigAuto).primary_key())
        .field(FieldSignature::new("username", FieldType::Char).max_length(100).unique())
        .field(FieldSignature::new("email", FieldType::Char).max_length(255))
}

fn post(title: &str) -> ModelSignature {
    ModelSignature::new("Post")
        .field(FieldSignature::new("id", FieldType::BigAuto).primary_key())
        .field(FieldSignature::new("author", FieldType::ForeignKey).related_model("blog.User"))
        .field(FieldSignature::new(title, FieldType::Char).max_length(200))
        .field(FieldSignature::new("content", FieldType::Text))
}

fn version_1() -> ProjectSignature {
    ProjectSignature::new().app(ApplicationSignature::new("blog").model(user()).model(post("title")))
}

fn version_2(title: &str) -> ProjectSignature {
    let post = post(title)
        .field(FieldSignature::new("summary", FieldType::Text).null(true))
        .field(FieldSignature::new("views", FieldType::Integer));
    ProjectSignature::new().app(ApplicationSignature::new("blog").model(user()).model(post))
}

// =============================================================================
// Authored Evolution
// =============================================================================

/// Renames are never detected, so this one is written by hand.
struct RenameTitle;

impl OxideEvolution for RenameTitle {
    const APP: &'static str = "blog";
    const LABEL: &'static str = "0003_rename_title";

    fn mutations() -> Vec<MutationSpec> {
        vec![MutationSpec::rename_field("blog", "Post", "title", "headline")]
    }
}

// =============================================================================
// Main: Demonstrate the Evolution System
// =============================================================================

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    println!("{}", "=".repeat(70));
    println!(" OXIDE-EVOLUTION: Blog Application Example");
    println!("{}", "=".repeat(70));
    println!();

    // Create in-memory SQLite database
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await?;

    let evolver = Evolver::new(
        Box::new(SqliteBackend::new()),
        SqliteLedger::new(pool.clone()),
        pool,
    );

    println!("[1] Initializing evolution ledger...");
    evolver.init().await?;
    println!("    Created oxide_evolution_versions and oxide_evolutions\n");

    println!("[2] Hinting the initial evolution...\n");
    let initial = evolver.hint(&version_1()).await?.into_evolution("0001_initial");
    for mutation in &initial.mutations {
        println!("    - {}", mutation.description());
    }
    println!();

    println!("[3] Applying version 1...\n");
    let mut evolutions = vec![initial];
    print_outcome(&evolver.evolve("blog", &evolutions, &version_1()).await?);

    println!("[4] Hinting version 2...\n");
    let hinted = evolver.hint(&version_2("title")).await?;
    let second = hinted.into_evolution("0002_summary_views");
    for note in &second.notes {
        println!("    ! {}", note);
    }
    println!();
    println!("    Evolution file content:");
    println!("{}", "-".repeat(70));
    println!("{}", second.to_json()?);
    println!("{}", "-".repeat(70));
    println!();

    println!("[5] Applying version 2...\n");
    evolutions.push(second);
    print_outcome(&evolver.evolve("blog", &evolutions, &version_2("title")).await?);

    println!("[6] Diffing a declared rename...\n");
    for mutation in evolver.pending_changes(&version_2("headline")).await? {
        println!("    - {}", mutation.description());
    }
    println!("    (a rename shows up as a deletion plus an addition)\n");

    println!("[7] Applying the authored rename...\n");
    evolutions.push(RenameTitle::to_evolution());
    print_outcome(&evolver.evolve("blog", &evolutions, &version_2("headline")).await?);

    println!("[8] Evolution history:\n");
    for record in evolver.ledger().records(Some("blog")).await? {
        println!(
            "    [X] {}/{} ({})",
            record.app,
            record.label,
            record.applied_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!();
    println!("{}", "=".repeat(70));
    println!(" Example completed successfully!");
    println!("{}", "=".repeat(70));

    Ok(())
}

fn print_outcome(outcome: &EvolveOutcome) {
    match outcome {
        EvolveOutcome::Applied(report) => {
            for sql in &report.statements {
                println!("    {};", sql);
            }
            println!("\n    Applied {}\n", report.labels.join(", "));
        }
        EvolveOutcome::AlreadyApplied { .. } => println!("    Nothing to do\n"),
    }
}
