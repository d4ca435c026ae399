//! Property-based tests for the metadata record codec.
//!
//! The on-disk `t` word carries the deletion state in its top two bits, so
//! timestamps are constrained to the 62-bit range the format can represent.

use proptest::prelude::*;
use timeranger::{MetaRecord, RecordState};

fn state_strategy() -> impl Strategy<Value = RecordState> {
    prop_oneof![
        Just(RecordState::Live),
        Just(RecordState::SoftDeleted),
        Just(RecordState::HardDeleted),
    ]
}

proptest! {
    /// Encoding then decoding any representable record is lossless.
    #[test]
    fn meta_record_roundtrip(
        t in 0u64..(1u64 << 62),
        tm in any::<u64>(),
        offset in any::<u64>(),
        size in any::<u32>(),
        user_flag in any::<u32>(),
        state in state_strategy(),
    ) {
        let rec = MetaRecord { t, tm, offset, size, user_flag, state };
        let back = MetaRecord::decode(&rec.encode());
        prop_assert_eq!(back, rec);
    }

    /// The user flag and the size never bleed into each other within the
    /// shared fourth word.
    #[test]
    fn user_flag_and_size_are_independent(size in any::<u32>(), user_flag in any::<u32>()) {
        let rec = MetaRecord { t: 1, tm: 2, offset: 3, size, user_flag, state: RecordState::Live };
        let back = MetaRecord::decode(&rec.encode());
        prop_assert_eq!(back.size, size);
        prop_assert_eq!(back.user_flag, user_flag);
    }
}
