use kasgate::address::{AddressService, DerivationOracle};
use kasgate::error::GatewayError;

struct SequentialOracle;

impl DerivationOracle for SequentialOracle {
    fn derive_child_public_key(&self, _xpub: &str, index: u32) -> Result<[u8; 32], GatewayError> {
        let mut bytes = [0u8; 32];
        bytes[28..].copy_from_slice(&index.to_be_bytes());
        Ok(bytes)
    }
}

#[test]
fn derived_addresses_are_deterministic_and_index_distinct() {
    let service = AddressService::with_oracle("testnet", Box::new(SequentialOracle));
    let (a0, path0) = service.derive_address("xpub-merchant", 0).unwrap();
    let (a0_again, path0_again) = service.derive_address("xpub-merchant", 0).unwrap();
    let (a1, path1) = service.derive_address("xpub-merchant", 1).unwrap();
    assert_eq!(a0, a0_again);
    assert_eq!(path0, path0_again);
    assert_ne!(a0, a1);
    assert_ne!(path0, path1);
    assert!(a0.starts_with("kaspatest:"));
}

#[test]
fn derive_address_returns_the_bip44_leaf_path_alongside_the_address() {
    let service = AddressService::with_oracle("testnet", Box::new(SequentialOracle));
    let (_address, path) = service.derive_address("xpub-merchant", 3).unwrap();
    assert_eq!(path, "m/44'/111111'/0'/0/3");
}

#[test]
fn verify_address_recovers_the_derivation_index() {
    let service = AddressService::with_oracle("testnet", Box::new(SequentialOracle));
    let (target, _path) = service.derive_address("xpub-merchant", 42).unwrap();
    assert_eq!(service.verify_address("xpub-merchant", &target, 100).unwrap(), Some(42));
    assert_eq!(service.verify_address("xpub-merchant", &target, 10).unwrap(), None);
}
