use gauntlet_core::demo;
use gauntlet_core::{AnalysisSettings, MutationAnalysis, MutationEngine, MutatorRegistry};
use std::time::Instant;

fn main() -> Result<(), anyhow::Error> {
    let mutators = MutatorRegistry::new().resolve(&["ALL".to_string()])?;
    let analysis = MutationAnalysis::new(MutationEngine::new(mutators), AnalysisSettings::default());

    println!("Analysing the demo date program...");
    let start_time = Instant::now();
    let report = analysis.run(&demo::program(), &demo::units())?;

    for result in &report.results {
        println!(
            "{:>12}  {}  (line {})",
            format!("{:?}", result.status),
            result.details.id,
            result.details.line.map_or("?".to_string(), |l| l.to_string())
        );
    }
    println!(
        "\nAnalysis finished in {:.2?}. Mutation score: {:.1}%",
        start_time.elapsed(),
        report.mutation_score()
    );
    Ok(())
}
