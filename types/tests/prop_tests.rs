use std::net::{IpAddr, Ipv4Addr};

use proptest::prelude::*;

use cfnode_types::gcs::derive_key;
use cfnode_types::{
    is_valid_amount, BlockHash, FilterHash, GcsFilter, NetAddress, ServiceFlags, Timestamp, Txid,
    MAX_MONEY,
};

fn v4(a: u8, b: u8, c: u8, d: u8) -> NetAddress {
    NetAddress::new(
        IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
        8333,
        ServiceFlags::NETWORK,
        Timestamp::EPOCH,
    )
}

proptest! {
    /// Hex display parses back to the same hash.
    #[test]
    fn block_hash_hex_roundtrip(bytes in prop::array::uniform32(0u8..)) {
        let hash = BlockHash::new(bytes);
        prop_assert_eq!(hash.to_string().parse::<BlockHash>().unwrap(), hash);
    }

    /// Txid::is_zero is true only for all-zero bytes.
    #[test]
    fn txid_is_zero_correct(bytes in prop::array::uniform32(0u8..)) {
        prop_assert_eq!(Txid::new(bytes).is_zero(), bytes == [0u8; 32]);
    }

    /// A filter header depends on the previous header, not only the filter.
    #[test]
    fn filter_header_commits_to_prev(
        filter in prop::collection::vec(any::<u8>(), 0..64),
        a in prop::array::uniform32(0u8..),
        b in prop::array::uniform32(0u8..),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(
            FilterHash::chain(&filter, &FilterHash::new(a)),
            FilterHash::chain(&filter, &FilterHash::new(b))
        );
    }

    /// A filter never misses an item it was built from.
    #[test]
    fn gcs_has_no_false_negatives(
        block in prop::array::uniform32(0u8..),
        items in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..40), 1..30),
        pick in any::<prop::sample::Index>(),
    ) {
        let key = derive_key(&BlockHash::new(block));
        let refs: Vec<&[u8]> = items.iter().map(|i| i.as_slice()).collect();
        let filter = GcsFilter::build(&key, &refs);
        prop_assert!(filter.n() as usize <= items.len());
        prop_assert!(filter.n() > 0);

        let member: &[u8] = *pick.get(&refs);
        prop_assert!(filter.match_any(&key, &[member]).unwrap());
        prop_assert!(filter.match_any(&key, &refs).unwrap());
    }

    /// Nothing matches an empty filter or an empty query.
    #[test]
    fn empty_sides_never_match(
        block in prop::array::uniform32(0u8..),
        item in prop::collection::vec(any::<u8>(), 1..40),
    ) {
        let key = derive_key(&BlockHash::new(block));
        let empty = GcsFilter::from_parts(0, Vec::new());
        prop_assert!(!empty.match_any(&key, &[item.as_slice()]).unwrap());
        let filter = GcsFilter::build(&key, &[item.as_slice()]);
        prop_assert!(!filter.match_any(&key, &[]).unwrap());
    }

    /// Timestamp elapsed_since saturates to 0 when now < self.
    #[test]
    fn timestamp_elapsed_since_saturates(base in 0u64..1_000_000, offset in 0u64..1_000_000) {
        let t = Timestamp::new(base);
        prop_assert_eq!(t.elapsed_since(Timestamp::new(base + offset)), offset);
        prop_assert_eq!(Timestamp::new(base + offset).elapsed_since(t), 0);
    }

    /// has_expired agrees with manual arithmetic.
    #[test]
    fn timestamp_has_expired_correct(
        start in 0u64..500_000,
        duration in 1u64..500_000,
        offset in 0u64..1_000_000,
    ) {
        let t = Timestamp::new(start);
        let now = Timestamp::new(start.saturating_add(offset));
        prop_assert_eq!(t.has_expired(duration, now), offset >= duration);
    }

    #[test]
    fn amount_validity_is_the_money_range(value in any::<i64>()) {
        prop_assert_eq!(is_valid_amount(value), (0..=MAX_MONEY).contains(&value));
    }

    /// Routable IPv4 addresses group by their /16.
    #[test]
    fn ipv4_groups_by_slash_16(
        a in 11u8..100,
        b in any::<u8>(),
        c1 in any::<u8>(), d1 in 1u8..255,
        c2 in any::<u8>(), d2 in 1u8..255,
        other in any::<u8>(),
    ) {
        prop_assert_eq!(v4(a, b, c1, d1).group_key(), v4(a, b, c2, d2).group_key());
        prop_assume!(other != b);
        prop_assert_ne!(v4(a, b, c1, d1).group_key(), v4(a, other, c1, d1).group_key());
    }

    #[test]
    fn service_flags_union_contains_both(x in any::<u64>(), y in any::<u64>()) {
        let union = ServiceFlags::new(x) | ServiceFlags::new(y);
        prop_assert!(union.contains(ServiceFlags::new(x)));
        prop_assert!(union.contains(ServiceFlags::new(y)));
        prop_assert_eq!(union.bits(), x | y);
    }
}
