//! Property tests for content addressing and packet framing.

use proptest::prelude::*;
use replistore_storage::address::{hash_path, upload_address, BLOCK_SIZE, SHARD_SEPARATOR};
use replistore_transport::tcp::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};

proptest! {
    #[test]
    fn prop_sharded_path_is_digest_in_blocks(key in ".{0,64}") {
        let address = hash_path(&key);
        prop_assert_eq!(address.digest.len(), 40);
        let shards: Vec<&str> = address.sharded_path.split(SHARD_SEPARATOR).collect();
        prop_assert_eq!(shards.len(), 40 / BLOCK_SIZE);
        prop_assert!(shards.iter().all(|s| s.len() == BLOCK_SIZE));
        prop_assert_eq!(shards.concat(), address.digest);
    }

    #[test]
    fn prop_owner_scopes_address(
        dir in "[a-z]{0,8}",
        name in "[a-z]{1,8}\\.txt",
        a in "[a-z]{1,6}@x\\.com",
        b in "[a-z]{1,6}@y\\.com",
    ) {
        prop_assert_eq!(upload_address(&a, &dir, &name), upload_address(&a, &dir, &name));
        prop_assert_ne!(upload_address(&a, &dir, &name), upload_address(&b, &dir, &name));
    }

    #[test]
    fn prop_frame_survives_the_wire(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let read = rt.block_on(async {
            let mut wire = Vec::new();
            write_frame(&mut wire, &payload).await.unwrap();
            prop_assert_eq!(wire.len(), payload.len() + 8);
            read_frame(&mut wire.as_slice(), DEFAULT_MAX_FRAME_BYTES).await.map_err(|e| TestCaseError::fail(e.to_string()))
        })?;
        prop_assert_eq!(read, payload);
    }
}
