mod common;

use muninn_switch_lib::{CLASS_DUMMY, CLASS_NETDEV, DpError, DpRegistry};

#[test]
fn open_close_destroy_lifecycle() {
    let registry = DpRegistry::new();
    registry.enable_dummy(false);

    let h1 = registry.open("x", CLASS_DUMMY, true).unwrap();
    let h2 = registry.open("x", CLASS_DUMMY, false).unwrap();
    assert_eq!(h1.name(), "x");
    assert_eq!(h2.name(), "x");
    assert_eq!(registry.enumerate(CLASS_DUMMY), vec!["x".to_string()]);

    // Closing one handle keeps the datapath alive for the other.
    h1.close();
    assert_eq!(registry.enumerate(CLASS_DUMMY), vec!["x".to_string()]);

    // Destroy only takes effect when the last handle goes away.
    h2.destroy();
    assert_eq!(registry.enumerate(CLASS_DUMMY), vec!["x".to_string()]);
    h2.close();
    assert!(registry.enumerate(CLASS_DUMMY).is_empty());

    assert!(matches!(
        registry.open("x", CLASS_DUMMY, false),
        Err(DpError::NotFound)
    ));
}

#[test]
fn create_of_existing_datapath_fails() {
    let (registry, dpif) = common::dummy_dp("dp");
    assert!(matches!(
        registry.open("dp", CLASS_DUMMY, true),
        Err(DpError::Exists)
    ));
    drop(dpif);
}

#[test]
fn open_missing_without_create_fails() {
    let registry = DpRegistry::new();
    registry.enable_dummy(false);
    assert!(matches!(
        registry.open("nope", CLASS_DUMMY, false),
        Err(DpError::NotFound)
    ));
}

#[test]
fn open_with_wrong_class_fails() {
    let (registry, dpif) = common::dummy_dp("dp");
    assert!(matches!(
        registry.open("dp", CLASS_NETDEV, false),
        Err(DpError::Invalid(_))
    ));
    drop(dpif);
}

#[test]
fn open_with_unknown_class_fails() {
    let registry = DpRegistry::new();
    assert!(matches!(
        registry.open("dp", "gre-system", true),
        Err(DpError::Unsupported(_))
    ));
}

#[test]
fn dummy_class_requires_registration() {
    let registry = DpRegistry::new();
    assert!(matches!(
        registry.open("dp", CLASS_DUMMY, true),
        Err(DpError::Unsupported(_))
    ));
}

#[test]
fn dummy_override_displaces_real_class() {
    let registry = DpRegistry::new();
    registry.enable_dummy(true);
    // The netdev class now opens in-memory devices, so creating the local
    // port succeeds without a registered system backend.
    let dpif = registry.open("dp", CLASS_NETDEV, true).unwrap();
    assert_eq!(dpif.class(), CLASS_NETDEV);
    assert_eq!(registry.enumerate(CLASS_NETDEV), vec!["dp".to_string()]);
}

#[test]
fn real_class_without_backends_cannot_open_ports() {
    let registry = DpRegistry::new();
    // The local port needs an "internal" device, which only the host can
    // register.
    assert!(matches!(
        registry.open("dp", CLASS_NETDEV, true),
        Err(DpError::Unsupported(_))
    ));
}

#[test]
fn registries_are_independent() {
    let (ra, da) = common::dummy_dp("same-name");
    let (rb, db) = common::dummy_dp("same-name");
    assert_eq!(ra.enumerate(CLASS_DUMMY).len(), 1);
    assert_eq!(rb.enumerate(CLASS_DUMMY).len(), 1);
    drop((da, db));
}
