// Demonstration: score a saved model against the random baseline.
//
// Run from the repo root:
//   cargo run --example policy_evaluation -- --episodes 50
//   cargo run --example policy_evaluation -- --algorithm dqn --model checkpoints/dqn-step00000500.json

use std::env;
use std::path::Path;

use ludorl::rl::{
    CorridorAction, CorridorEnvironment, DqnTrainer, EvaluationMetrics, PpoTrainer, QAgent,
    RLConfig, RLError, RandomPolicy,
};
use ludorl::rl::Policy;
use ludorl::Learner;
use tracing_subscriber::EnvFilter;

const CORRIDOR_LENGTH: usize = 8;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let episodes: usize = arg_value(&args, "--episodes")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);
    let max_steps = 4 * CORRIDOR_LENGTH;

    let mut env = match CorridorEnvironment::new(CORRIDOR_LENGTH, 1, max_steps) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let baseline = RandomPolicy::<CorridorAction>::seeded(7);
    match EvaluationMetrics::evaluate(&mut env, &baseline, episodes, max_steps) {
        Ok(metrics) => {
            println!("Policy: random");
            println!("{metrics}");
        }
        Err(e) => eprintln!("Random baseline failed: {e}"),
    }

    let Some(model) = arg_value(&args, "--model") else {
        return;
    };
    let algorithm = arg_value(&args, "--algorithm").unwrap_or("q-learning");
    let learner = match load(algorithm, Path::new(model)) {
        Ok(learner) => learner,
        Err(e) => {
            eprintln!("Cannot load '{model}': {e}");
            std::process::exit(1);
        }
    };
    match EvaluationMetrics::evaluate(&mut env, learner.as_ref(), episodes, max_steps) {
        Ok(metrics) => {
            println!("Policy: {} ({model})", learner.name());
            println!("{metrics}");
        }
        Err(e) => eprintln!("Evaluation failed: {e}"),
    }
}

/// Builds a greedy learner of the requested kind and restores `path` into it.
fn load(algorithm: &str, path: &Path) -> Result<Box<dyn Learner<CorridorAction>>, RLError> {
    let config = RLConfig {
        exploration_rate: 0.0,
        ..RLConfig::default()
    };
    let learner: Box<dyn Learner<CorridorAction>> = match algorithm {
        "q-learning" => Box::new(QAgent::<CorridorAction>::new(CORRIDOR_LENGTH, config)?),
        "dqn" => Box::new(DqnTrainer::<CorridorAction>::new(CORRIDOR_LENGTH, config)?),
        "ppo" => Box::new(PpoTrainer::<CorridorAction>::new(CORRIDOR_LENGTH, config)?),
        other => {
            return Err(RLError::InvalidConfig(format!(
                "unknown algorithm '{other}'"
            )))
        }
    };
    learner.load_model(path)?;
    learner.set_exploration_rate(0.0)?;
    Ok(learner)
}

fn arg_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}
