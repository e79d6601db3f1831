use proptest::prelude::*;

use splitxfer::{
    checksum::{
        Checksum,
        digest_bytes,
    },
    chunker::{
        Chunker,
        merge,
    },
};

proptest! {
    #[test]
    fn split_then_merge_is_identity(data in proptest::collection::vec(any::<u8>(), 0..4096), size in 1usize..600) {
        let chunker = Chunker::new(size).unwrap();
        let fragments: Vec<_> = chunker.split(data.as_slice()).collect::<Result<_, _>>().unwrap();

        let mut out = vec![];
        merge(fragments, &mut out).unwrap();
        prop_assert_eq!(out, data);
    }

    #[test]
    fn fragment_count_and_sizes(len in 0usize..5000, size in 1usize..700) {
        let data = vec![0x5au8; len];
        let chunker = Chunker::new(size).unwrap();
        let fragments: Vec<_> = chunker.split(data.as_slice()).collect::<Result<_, _>>().unwrap();

        prop_assert_eq!(fragments.len(), len.div_ceil(size));
        prop_assert_eq!(fragments.len() as u64, chunker.fragment_count(len as u64));
        if let Some((last, rest)) = fragments.split_last() {
            prop_assert!(rest.iter().all(|f| f.len() == size));
            prop_assert!(!last.is_empty() && last.len() <= size);
        }
    }

    #[test]
    fn digest_ignores_fragment_boundaries(data in proptest::collection::vec(any::<u8>(), 0..4096), size in 1usize..600) {
        let mut checksum = Checksum::new();
        for fragment in Chunker::new(size).unwrap().split(data.as_slice()) {
            checksum.update(&fragment.unwrap().data);
        }
        prop_assert_eq!(checksum.finalize(), digest_bytes(&data));
    }
}
