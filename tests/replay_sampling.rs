use std::collections::HashMap;

use ludorl::rl::training::{PrioritizedReplayBuffer, ReplayParams};
use ludorl::rl::{CorridorAction, Experience, RLError, StateVector};

fn params(capacity: usize) -> ReplayParams {
    ReplayParams {
        capacity,
        alpha: 0.6,
        epsilon: 0.01,
        beta_start: 0.4,
        beta_increment: 0.001,
    }
}

/// Experience tagged by its reward so draws can be told apart.
fn tagged(tag: u32) -> Experience<CorridorAction> {
    Experience::new(
        StateVector::new(vec![f64::from(tag), 0.0]),
        CorridorAction::Right,
        f64::from(tag),
        StateVector::new(vec![f64::from(tag) + 1.0, 0.0]),
        false,
    )
    .unwrap()
}

fn frequencies(
    buffer: &PrioritizedReplayBuffer<CorridorAction>,
    draws: usize,
) -> HashMap<u32, f64> {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for _ in 0..draws {
        let batch = buffer.sample_batch(1).unwrap();
        *counts.entry(batch.experiences[0].reward() as u32).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(tag, n)| (tag, n as f64 / draws as f64))
        .collect()
}

#[test]
fn fifth_insert_evicts_first_and_sampling_is_uniform() {
    let buffer = PrioritizedReplayBuffer::new(params(4), Some(11)).unwrap();
    for tag in 1..=5 {
        buffer.add(tagged(tag), None).unwrap();
    }
    assert_eq!(buffer.len(), 4);
    let stored: Vec<u32> = buffer.snapshot().iter().map(|e| e.reward() as u32).collect();
    assert!(!stored.contains(&1));

    let freq = frequencies(&buffer, 20_000);
    assert!(!freq.contains_key(&1));
    for tag in 2..=5 {
        let f = freq.get(&tag).copied().unwrap_or(0.0);
        assert!((f - 0.25).abs() < 0.02, "tag {tag} drawn with frequency {f}");
    }
}

#[test]
fn draws_follow_priority_mass() {
    let buffer = PrioritizedReplayBuffer::new(params(4), Some(5)).unwrap();
    for tag in 1..=4 {
        buffer.add(tagged(tag), Some(f64::from(tag))).unwrap();
    }
    let freq = frequencies(&buffer, 40_000);
    for tag in 1..=4 {
        let expected = f64::from(tag) / 10.0;
        let f = freq.get(&tag).copied().unwrap_or(0.0);
        assert!((f - expected).abs() < 0.015, "tag {tag}: {f} vs {expected}");
    }
}

#[test]
fn overfilled_buffer_keeps_most_recent() {
    let buffer = PrioritizedReplayBuffer::new(params(8), Some(1)).unwrap();
    for tag in 1..=13 {
        buffer.add(tagged(tag), None).unwrap();
    }
    assert_eq!(buffer.len(), 8);
    let mut stored: Vec<u32> = buffer.snapshot().iter().map(|e| e.reward() as u32).collect();
    stored.sort_unstable();
    assert_eq!(stored, (6..=13).collect::<Vec<_>>());
    buffer.verify().unwrap();
}

#[test]
fn batch_has_no_duplicates_and_normalized_weights() {
    let buffer = PrioritizedReplayBuffer::new(params(16), Some(2)).unwrap();
    for tag in 1..=16 {
        buffer.add(tagged(tag), Some(0.1 * f64::from(tag))).unwrap();
    }
    let batch = buffer.sample_batch(16).unwrap();
    let mut slots: Vec<usize> = batch.indices.iter().map(|i| i.slot).collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), 16);
    let max = batch.weights.iter().copied().fold(0.0, f64::max);
    assert!((max - 1.0).abs() < 1e-12);
    assert!(batch.weights.iter().all(|&w| w > 0.0 && w <= 1.0));
}

#[test]
fn priority_updates_for_recycled_slots_are_ignored() {
    let buffer = PrioritizedReplayBuffer::new(params(4), Some(3)).unwrap();
    for tag in 1..=4 {
        buffer.add(tagged(tag), None).unwrap();
    }
    let batch = buffer.sample_batch(2).unwrap();
    for tag in 5..=8 {
        buffer.add(tagged(tag), None).unwrap();
    }
    let applied = buffer.update_priorities(&batch.indices, &[5.0, 5.0]).unwrap();
    assert_eq!(applied, 0);
    assert!(buffer.get(batch.indices[0]).is_none());
    buffer.verify().unwrap();
}

#[test]
fn beta_anneals_toward_one() {
    let mut p = params(4);
    p.beta_increment = 0.3;
    let buffer = PrioritizedReplayBuffer::new(p, Some(4)).unwrap();
    for tag in 1..=4 {
        buffer.add(tagged(tag), None).unwrap();
    }
    let betas: Vec<f64> = (0..4).map(|_| buffer.sample_batch(1).unwrap().beta).collect();
    assert!((betas[0] - 0.4).abs() < 1e-12);
    assert!((betas[1] - 0.7).abs() < 1e-12);
    assert_eq!(betas[2], 1.0);
    assert_eq!(betas[3], 1.0);
}

#[test]
fn concurrent_writers_and_samplers_keep_tree_consistent() {
    let buffer = PrioritizedReplayBuffer::new(params(64), Some(8)).unwrap();
    for tag in 0..32 {
        buffer.add(tagged(tag), None).unwrap();
    }
    std::thread::scope(|scope| {
        for worker in 0..4u32 {
            let buffer = &buffer;
            scope.spawn(move || {
                for i in 0..200u32 {
                    buffer.add(tagged(worker * 1000 + i), None).unwrap();
                }
            });
        }
        for _ in 0..2 {
            let buffer = &buffer;
            scope.spawn(move || {
                for _ in 0..200 {
                    let batch = buffer.sample_batch(8).unwrap();
                    let tds: Vec<f64> = batch.weights.iter().map(|w| w * 2.0).collect();
                    buffer.update_priorities(&batch.indices, &tds).unwrap();
                }
            });
        }
    });
    assert_eq!(buffer.len(), 64);
    buffer.verify().unwrap();
}

#[test]
fn shutdown_is_idempotent_and_final() {
    let buffer = PrioritizedReplayBuffer::new(params(4), None).unwrap();
    buffer.add(tagged(1), None).unwrap();
    buffer.shutdown();
    buffer.shutdown();
    assert_eq!(buffer.add(tagged(2), None), Err(RLError::Shutdown));
    assert!(matches!(buffer.sample_batch(1), Err(RLError::Shutdown)));
    assert_eq!(buffer.len(), 1);
}

#[test]
fn sampling_more_than_stored_is_insufficient_data() {
    let buffer = PrioritizedReplayBuffer::<CorridorAction>::new(params(4), None).unwrap();
    assert!(matches!(
        buffer.sample_batch(1),
        Err(RLError::InsufficientData {
            requested: 1,
            available: 0
        })
    ));
    buffer.add(tagged(1), None).unwrap();
    assert!(matches!(
        buffer.sample_batch(2),
        Err(RLError::InsufficientData { .. })
    ));
}
