// tests/property/type_list_test.rs

//! Property-based tests for negotiated type lists and mappings.

use crate::test_helpers::ToServer;
use craftlink::core::messages::MessageRegistry;
use craftlink::core::protocol::{TypeMapping, primitives};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_type_list_survives_the_wire(names in prop::collection::vec("[A-Za-z][A-Za-z0-9_.]{0,40}", 0..50)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let decoded = rt.block_on(async {
            let mut buf = Vec::new();
            primitives::write_type_list(&mut buf, &names[..]).await.unwrap();
            primitives::read_type_list(&mut buf.as_slice()).await.unwrap()
        });
        prop_assert_eq!(decoded, names);
    }

    #[test]
    fn test_announced_mapping_follows_peer_order(
        order in Just(ToServer::names()).prop_shuffle(),
        unknown in prop::collection::vec("Unknown[0-9]{1,3}", 0..5),
    ) {
        let mut announced: Vec<String> = order.iter().map(|n| n.to_string()).collect();
        announced.extend(unknown);
        let mapping = TypeMapping::from_announced::<ToServer, _>(&announced[..]);
        for (code, name) in announced.iter().enumerate() {
            match mapping.code_of(name) {
                Some(found) => prop_assert_eq!(usize::from(found), code),
                None => prop_assert!(ToServer::kind(name).is_none()),
            }
        }
        prop_assert_eq!(mapping.len(), ToServer::names().len());
    }
}
