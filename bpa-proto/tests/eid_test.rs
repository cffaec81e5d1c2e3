use bpa_proto::eid::*;

#[test]
fn dtn_eids_validate() {
    assert!(validate_eid("dtn://node/").is_ok());
    assert!(validate_eid("dtn://node/app").is_ok());
    assert!(validate_eid("dtn:none").is_ok());
    assert!(validate_eid("dtn:").is_err());
    assert!(validate_eid("node").is_err());
    assert!(validate_eid("http://x/").is_err());
}

#[test]
fn ipn_eids_validate() {
    assert!(validate_eid("ipn:1.0").is_ok());
    assert!(validate_eid("ipn:1.7").is_ok());
    // Node number 0 is tolerated as a null-like EID.
    assert!(validate_eid("ipn:0.0").is_ok());
    assert!(validate_eid("ipn:1").is_err());
    assert!(validate_eid("ipn:a.b").is_err());
    assert!(validate_eid("ipn:1.").is_err());
}

#[test]
fn local_eid_rules() {
    assert!(validate_local_eid("dtn://a/").is_ok());
    assert!(validate_local_eid("dtn://a").is_err());
    assert!(validate_local_eid("ipn:3.0").is_ok());
    assert!(validate_local_eid("ipn:3.1").is_err());
    assert!(validate_local_eid("ipn:0.0").is_ok());
}

#[test]
fn preprocess_appends_slash() {
    assert_eq!(preprocess_local_eid("dtn://a"), "dtn://a/");
    assert_eq!(preprocess_local_eid("dtn://a/"), "dtn://a/");
    assert_eq!(preprocess_local_eid("ipn:1.0"), "ipn:1.0");
}

#[test]
fn node_id_extraction() {
    assert_eq!(node_id_of("dtn://a/app").as_deref(), Some("dtn://a/"));
    assert_eq!(node_id_of("dtn://a/").as_deref(), Some("dtn://a/"));
    assert_eq!(node_id_of("ipn:9.42").as_deref(), Some("ipn:9.0"));
    assert_eq!(node_id_of("dtn://"), None);
    assert_eq!(node_id_of("dtn:none"), None);
}

#[test]
fn sink_validation_per_scheme() {
    assert!(validate_sink_for_scheme("echo", EidScheme::Dtn).is_ok());
    assert!(validate_sink_for_scheme("my sink", EidScheme::Dtn).is_err());
    assert!(validate_sink_for_scheme("9001", EidScheme::Ipn).is_ok());
    assert!(validate_sink_for_scheme("echo", EidScheme::Ipn).is_err());
}
