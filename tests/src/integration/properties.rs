//! # Log Properties
//!
//! Random append/truncate histories checked against a plain vector, and
//! readers rebuilding the log purely from the writer's proofs.

/// One step of a writer history.
#[derive(Debug, Clone)]
pub enum Op {
    /// Append these blocks.
    Append(Vec<Vec<u8>>),
    /// Truncate to this share of the current length, in percent.
    Truncate(u8),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use omega_core::{
        Core, CoreConfig, CoreStorage, Ed25519Authorization, ProofRequest, RequestBlock,
        RequestUpgrade,
    };
    use proptest::prelude::*;

    use super::Op;

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..40), 1..6)
                .prop_map(Op::Append),
            1 => (0u8..=100).prop_map(Op::Truncate),
        ]
    }

    fn apply(core: &mut Core, model: &mut Vec<Vec<u8>>, op: &Op) {
        match op {
            Op::Append(blocks) => {
                core.append(blocks).unwrap();
                model.extend(blocks.iter().cloned());
            }
            Op::Truncate(percent) => {
                let length = model.len() as u64 * u64::from(*percent) / 100;
                core.truncate(length).unwrap();
                model.truncate(length as usize);
            }
        }
    }

    fn reader_of(writer: &Core) -> Core {
        let auth = Ed25519Authorization::from_public_key(writer.key()).unwrap();
        Core::open(CoreStorage::memory(), Arc::new(auth), CoreConfig::for_testing()).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn test_history_matches_model(ops in proptest::collection::vec(op(), 1..20)) {
            let mut core = Core::memory(CoreConfig::for_testing()).unwrap();
            let mut model = Vec::new();
            let mut truncations = 0;
            for op in &ops {
                apply(&mut core, &mut model, op);
                if matches!(op, Op::Truncate(_)) {
                    truncations += 1;
                }
            }

            prop_assert_eq!(core.length(), model.len() as u64);
            prop_assert_eq!(core.fork(), truncations);
            let bytes: usize = model.iter().map(Vec::len).sum();
            prop_assert_eq!(core.byte_length(), bytes as u64);
            for (index, block) in model.iter().enumerate() {
                prop_assert_eq!(core.get(index as u64).unwrap(), Some(block.clone()));
            }
            prop_assert!(!core.has(model.len() as u64));
        }

        #[test]
        fn test_reader_rebuilds_from_proofs(
            ops in proptest::collection::vec(op(), 1..12),
            picks in proptest::collection::vec(any::<prop::sample::Index>(), 1..8),
        ) {
            let mut writer = Core::memory(CoreConfig::for_testing()).unwrap();
            let mut model = Vec::new();
            for op in &ops {
                apply(&mut writer, &mut model, op);
            }
            prop_assume!(!model.is_empty());

            let mut reader = reader_of(&writer);
            let fork = writer.fork();
            let length = writer.length();
            let first = picks[0].index(model.len()) as u64;
            let mut rest = &picks[1..];

            if fork == 0 {
                // First answer carries the signed upgrade along with a block.
                let request = ProofRequest {
                    fork,
                    block: Some(RequestBlock { index: first, nodes: 0 }),
                    upgrade: Some(RequestUpgrade { start: 0, length }),
                    ..Default::default()
                };
                let outcome = reader.verify(&writer.proof(&request).unwrap()).unwrap();
                prop_assert!(outcome.upgraded);
                prop_assert_eq!(outcome.downloaded, Some(first));
            } else {
                // A truncated writer is adopted as a fork with no shared blocks.
                let upgrade = ProofRequest::upgrade(fork, 0, length);
                let mut reorg = reader.reorg(&writer.proof(&upgrade).unwrap()).unwrap();
                while let Some(request) = reorg.request() {
                    let proof = writer.proof(&request).unwrap();
                    reader.update_reorg(&mut reorg, &proof).unwrap();
                }
                let outcome = reader.apply_reorg(reorg).unwrap();
                prop_assert_eq!((outcome.fork, outcome.length, outcome.ancestors), (fork, length, 0));
                rest = &picks[..];
            }

            for pick in rest {
                let index = pick.index(model.len()) as u64;
                if reader.has(index) {
                    continue;
                }
                let nodes = reader.missing_nodes(2 * index).unwrap();
                let proof = writer.proof(&ProofRequest::block(fork, index, nodes)).unwrap();
                let outcome = reader.verify(&proof).unwrap();
                prop_assert!(!outcome.upgraded);
            }

            prop_assert_eq!(reader.length(), length);
            prop_assert_eq!(reader.byte_length(), writer.byte_length());
            for pick in &picks {
                let index = pick.index(model.len());
                prop_assert_eq!(reader.get(index as u64).unwrap(), Some(model[index].clone()));
            }
        }
    }
}
