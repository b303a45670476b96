// Demonstration: train a learner on parallel corridor environments.
//
// Run from the repo root:
//   RUST_LOG=info cargo run --example corridor_training -- --algorithm dqn --steps 2000
//   cargo run --features rl-nn --example corridor_training -- --algorithm ppo --backend torch

use std::env;
use std::sync::Arc;

use ludorl::rl::{
    CheckpointPolicy, CorridorAction, CorridorEnvironment, DqnTrainer, EvaluationMetrics,
    ExplorationSchedule, OrchestratorConfig, PpoTrainer, QAgent, RLConfig, RLError,
    TrainingOrchestrator,
};
use ludorl::rl::Policy;
use ludorl::Learner;
use tracing_subscriber::EnvFilter;

const CORRIDOR_LENGTH: usize = 8;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let algorithm = arg_value(&args, "--algorithm").unwrap_or("q-learning");
    let steps: u64 = arg_value(&args, "--steps")
        .and_then(|s| s.parse().ok())
        .unwrap_or(2_000);
    let workers: usize = arg_value(&args, "--envs")
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    let checkpoint_dir = arg_value(&args, "--checkpoint-dir");
    let backend = arg_value(&args, "--backend").unwrap_or("ndarray");

    let mut config = RLConfig {
        seed: Some(42),
        ..RLConfig::default()
    };
    if let Some(path) = arg_value(&args, "--config") {
        match std::fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|text| {
            RLConfig::parse(&text).map_err(|e| e.to_string())
        }) {
            Ok(parsed) => config = parsed,
            Err(e) => {
                eprintln!("Cannot load config '{path}': {e}");
                std::process::exit(2);
            }
        }
    }

    let learner: Arc<dyn Learner<CorridorAction>> = match build_learner(algorithm, backend, config) {
        Ok(learner) => learner,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    // DQN anneals its own ε; the others follow the orchestrator's schedule.
    let exploration = (algorithm != "dqn").then_some(ExplorationSchedule {
        start: 1.0,
        end: 0.05,
        decay_steps: steps / 2,
    });
    let orch_config = OrchestratorConfig {
        checkpoint: checkpoint_dir.map(|dir| CheckpointPolicy::new(steps / 4, dir)),
        log_interval: (steps / 10).max(1),
        exploration,
        ..OrchestratorConfig::default()
    };
    let environments = (0..workers)
        .map(|i| {
            CorridorEnvironment::new(CORRIDOR_LENGTH, 2, 4 * CORRIDOR_LENGTH)
                .map(|env| env.with_random_starts(i as u64))
        })
        .collect::<Result<Vec<_>, _>>();
    let environments = match environments {
        Ok(envs) => envs,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let mut orchestrator =
        match TrainingOrchestrator::new(Arc::clone(&learner), environments, orch_config) {
            Ok(orch) => orch,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        };

    match orchestrator.run(Some(steps)) {
        Ok(report) => println!("{report}"),
        Err(e) => {
            eprintln!("Training halted: {e}");
            std::process::exit(1);
        }
    }
    println!("{}", orchestrator.snapshot());

    let _ = learner.set_exploration_rate(0.0);
    let mut eval_env = match CorridorEnvironment::new(CORRIDOR_LENGTH, 1, 4 * CORRIDOR_LENGTH) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    match EvaluationMetrics::evaluate(&mut eval_env, learner.as_ref(), 20, 100) {
        Ok(metrics) => {
            println!("Policy: {}", learner.name());
            println!("{metrics}");
        }
        Err(e) => eprintln!("Evaluation failed: {e}"),
    }
    orchestrator.shutdown();
}

fn build_learner(
    algorithm: &str,
    backend: &str,
    config: RLConfig,
) -> Result<Arc<dyn Learner<CorridorAction>>, RLError> {
    if backend == "torch" {
        return build_torch_learner(algorithm, config);
    }
    if backend != "ndarray" {
        return Err(RLError::InvalidConfig(format!(
            "unknown --backend '{backend}', expected 'ndarray' or 'torch'"
        )));
    }
    let learner: Arc<dyn Learner<CorridorAction>> = match algorithm {
        "q-learning" => Arc::new(QAgent::<CorridorAction>::new(CORRIDOR_LENGTH, config)?),
        "dqn" => Arc::new(DqnTrainer::<CorridorAction>::new(CORRIDOR_LENGTH, config)?),
        "ppo" => Arc::new(PpoTrainer::<CorridorAction>::new(CORRIDOR_LENGTH, config)?),
        other => {
            return Err(RLError::InvalidConfig(format!(
                "unknown --algorithm '{other}', expected 'q-learning', 'dqn' or 'ppo'"
            )))
        }
    };
    Ok(learner)
}

#[cfg(feature = "rl-nn")]
fn build_torch_learner(
    algorithm: &str,
    config: RLConfig,
) -> Result<Arc<dyn Learner<CorridorAction>>, RLError> {
    use ludorl::rl::{TorchDqnTrainer, TorchPpoTrainer};

    let device = tch::Device::cuda_if_available();
    let learner: Arc<dyn Learner<CorridorAction>> = match algorithm {
        "dqn" => Arc::new(TorchDqnTrainer::<CorridorAction>::on_device(
            CORRIDOR_LENGTH,
            config,
            device,
        )?),
        "ppo" => Arc::new(TorchPpoTrainer::<CorridorAction>::on_device(
            CORRIDOR_LENGTH,
            config,
            device,
        )?),
        other => {
            return Err(RLError::InvalidConfig(format!(
                "--backend torch supports 'dqn' and 'ppo', not '{other}'"
            )))
        }
    };
    Ok(learner)
}

#[cfg(not(feature = "rl-nn"))]
fn build_torch_learner(
    _algorithm: &str,
    _config: RLConfig,
) -> Result<Arc<dyn Learner<CorridorAction>>, RLError> {
    Err(RLError::InvalidConfig(
        "--backend torch needs the rl-nn feature".into(),
    ))
}

fn arg_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}
