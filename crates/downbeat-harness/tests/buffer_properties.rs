//! Model-based tests for `BoundedBuffer`.
//!
//! Non-blocking operations are applied to both the buffer and a `VecDeque`
//! model; observable state must agree after every step.

use std::collections::VecDeque;

use downbeat_harness::BoundedBuffer;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Put(u8),
    Take,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u8>().prop_map(Op::Put),
        2 => Just(Op::Take),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Buffer behaves like a capacity-limited FIFO.
    #[test]
    fn prop_matches_fifo_model(
        capacity in 1usize..5,
        ops in prop::collection::vec(op_strategy(), 0..60),
    ) {
        let buffer = BoundedBuffer::new(capacity);
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                Op::Put(item) => {
                    let accepted = buffer.try_put(item).is_ok();
                    prop_assert_eq!(accepted, model.len() < capacity);
                    if accepted {
                        model.push_back(item);
                    }
                },
                Op::Take => prop_assert_eq!(buffer.try_take(), model.pop_front()),
            }

            prop_assert_eq!(buffer.len(), model.len());
            prop_assert!(buffer.len() <= buffer.capacity());
        }
    }
}
