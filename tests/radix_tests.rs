//! Integration tests for radix decomposition.

use gpufft::config::{PerformanceOptions, PlannerConfig};
use gpufft::radix::{Constraints, DecompositionError, RadixFactorizer, StepFootprint, SUPPORTED_RADICES};

fn lengths() -> Vec<u32> {
    let mut lengths = Vec::new();
    for a in 0..=12u32 {
        for b in 0..=2u32 {
            for c in 0..=1u32 {
                let n = 2u32.pow(a) * 3u32.pow(b) * 5u32.pow(c);
                if n <= 4096 {
                    lengths.push(n);
                }
            }
        }
    }
    lengths
}

#[test]
fn test_large_radices_win_at_4096() {
    let factorizer = RadixFactorizer::default();
    let constraints = Constraints {
        allowed_radices: vec![4, 8, 16, 64],
        max_shared_memory_elements: 1024,
        ..Constraints::default()
    };
    let decomposition = factorizer.enumerate(4096, &constraints).unwrap();

    let chains: Vec<Vec<u32>> = decomposition
        .candidates
        .iter()
        .map(|c| c.chain.radices())
        .collect();
    assert!(chains.contains(&vec![64, 64]));
    assert!(chains.contains(&vec![8, 8, 8, 8]));

    let best = decomposition.best().unwrap();
    assert_eq!(best.chain.radices(), vec![64, 64]);
    assert_eq!(best.cost.passes, 2);

    let long = factorizer.estimate(4096 * 32, &[8, 8, 8, 8, 8, 4], &constraints);
    assert!(best.cost.total < long.total);
}

#[test]
fn test_shared_memory_limit_excludes_large_steps() {
    let config = PlannerConfig {
        performance: PerformanceOptions {
            workgroup_size_x: 64,
            workgroup_size_y: 1,
            lanes: 4,
        },
        ..PlannerConfig::default()
    };
    let factorizer = RadixFactorizer::new(&config);
    let constraints = Constraints {
        allowed_radices: vec![4, 8, 16, 64],
        max_shared_memory_elements: 1024,
        max_work_group_invocations: 256,
    };
    assert!(!factorizer.is_feasible(64, &constraints));

    let decomposition = factorizer.enumerate(4096, &constraints).unwrap();
    for candidate in &decomposition.candidates {
        assert!(!candidate.chain.radices().contains(&64));
        for group in factorizer.groups(&candidate.chain.radices(), &constraints) {
            let radix: u32 = group.iter().product();
            assert!(StepFootprint::for_radix(radix, factorizer.performance()).fits(&constraints));
        }
    }
}

#[test]
fn test_prime_length_fails() {
    let factorizer = RadixFactorizer::default();
    let result = factorizer.enumerate(17, &Constraints::default());
    assert_eq!(
        result,
        Err(DecompositionError::NoChain {
            length: 17,
            radices: vec![64, 16, 8, 4]
        })
    );

    let all = Constraints::default().with_radices(&SUPPORTED_RADICES);
    assert!(matches!(
        factorizer.enumerate(7 * 64, &all),
        Err(DecompositionError::NoChain { .. })
    ));
}

#[test]
fn test_every_chain_multiplies_to_length() {
    let factorizer = RadixFactorizer::default();
    let constraints = Constraints::default().with_radices(&SUPPORTED_RADICES);
    for length in lengths() {
        let decomposition = factorizer.enumerate(length, &constraints).unwrap();
        assert!(!decomposition.is_empty(), "no chain for {}", length);
        for candidate in &decomposition.candidates {
            assert_eq!(candidate.chain.product(), length as u64);
            let radices = candidate.chain.radices();
            assert!(radices.iter().all(|r| constraints.allowed_radices.contains(r)));
            assert!(radices.windows(2).all(|w| w[0] >= w[1]));
            assert!(candidate.cost.total.is_finite());
        }
    }
}

#[test]
fn test_enumeration_is_deterministic() {
    let factorizer = RadixFactorizer::default();
    let constraints = Constraints::default().with_radices(&SUPPORTED_RADICES);
    for length in [60, 256, 1000, 2048, 3840] {
        let first = factorizer.enumerate(length, &constraints).unwrap();
        let second = factorizer.enumerate(length, &constraints).unwrap();
        assert_eq!(first, second);

        let ranked: Vec<Vec<u32>> = first.ranked().iter().map(|c| c.chain.radices()).collect();
        let again: Vec<Vec<u32>> = second.ranked().iter().map(|c| c.chain.radices()).collect();
        assert_eq!(ranked, again);
    }
}

#[test]
fn test_ranking_is_sorted_by_cost() {
    let factorizer = RadixFactorizer::default();
    let decomposition = factorizer.enumerate(1024, &Constraints::default()).unwrap();
    let ranked = decomposition.ranked();
    for pair in ranked.windows(2) {
        assert!(pair[0].cost.rank(&pair[1].cost) != std::cmp::Ordering::Greater);
    }
}
