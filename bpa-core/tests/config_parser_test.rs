use bpa_core::config::parser::ConfigParser;
use bpa_core::processor::{RouterCommand, RouterCommandType};

fn parse_all(input: &[u8]) -> Result<Vec<RouterCommand>, usize> {
    let mut parser = ConfigParser::new();
    let mut out = Vec::new();
    parser.read(input, &mut out)?;
    Ok(out)
}

#[test]
fn minimal_add_command() {
    let commands = parse_all(b"1(dtn://b/);").unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command_type, RouterCommandType::Add);
    assert_eq!(commands[0].node.eid, "dtn://b/");
    assert!(commands[0].node.cla_addr.is_none());
}

#[test]
fn full_add_command() {
    let commands = parse_all(
        b"1(dtn://b/),200:(mtcp:10.0.0.42:4224):[(dtn://app1/x),(dtn://app2/y)]:[{10,20,1000,[(dtn://c/z)]},{30,40,2000}];",
    )
    .unwrap();
    assert_eq!(commands.len(), 1);
    let node = &commands[0].node;
    assert_eq!(node.eid, "dtn://b/");
    assert_eq!(node.cla_addr.as_deref(), Some("mtcp:10.0.0.42:4224"));
    // Endpoint EIDs are normalized to node IDs.
    assert_eq!(node.endpoints, vec!["dtn://app1/", "dtn://app2/"]);
    assert_eq!(node.contacts.len(), 2);
    assert_eq!(node.contacts[0].from_ms, 10_000);
    assert_eq!(node.contacts[0].to_ms, 20_000);
    assert_eq!(node.contacts[0].bitrate_bytes_per_s, 1000);
    assert_eq!(node.contacts[0].contact_endpoints, vec!["dtn://c/"]);
    assert_eq!(node.contacts[1].bitrate_bytes_per_s, 2000);
}

#[test]
fn update_and_delete_and_query_types() {
    for (byte, expected) in [
        (b'2', RouterCommandType::Update),
        (b'3', RouterCommandType::Delete),
        (b'4', RouterCommandType::Query),
    ] {
        let input = [&[byte][..], b"(ipn:7.0);"].concat();
        let commands = parse_all(&input).unwrap();
        assert_eq!(commands[0].command_type, expected);
        assert_eq!(commands[0].node.eid, "ipn:7.0");
    }
}

#[test]
fn reliability_is_range_checked_then_ignored() {
    assert!(parse_all(b"1(dtn://b/),100;").is_ok());
    assert!(parse_all(b"1(dtn://b/),1000;").is_ok());
    assert!(parse_all(b"1(dtn://b/),99;").is_err());
    assert!(parse_all(b"1(dtn://b/),1001;").is_err());
    let commands = parse_all(b"1(dtn://b/),500:(mtcp:x);").unwrap();
    assert_eq!(commands[0].node.cla_addr.as_deref(), Some("mtcp:x"));
}

#[test]
fn multiple_commands_in_one_buffer() {
    let commands = parse_all(b"1(dtn://b/);3(dtn://c/);").unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].command_type, RouterCommandType::Add);
    assert_eq!(commands[1].command_type, RouterCommandType::Delete);
    assert_eq!(commands[1].node.eid, "dtn://c/");
}

#[test]
fn split_input_across_reads() {
    let input = b"1(dtn://b/):(mtcp:x);";
    let mut parser = ConfigParser::new();
    let mut out = Vec::new();
    let (a, b) = input.split_at(9);
    parser.read(a, &mut out).unwrap();
    assert!(out.is_empty());
    parser.read(b, &mut out).unwrap();
    assert_eq!(out.len(), 1);
}

#[test]
fn malformed_input_reports_offset_and_resets() {
    let mut parser = ConfigParser::new();
    let mut out = Vec::new();
    let err = parser.read(b"1(dtn://b/)!garbage", &mut out).unwrap_err();
    assert_eq!(err, 11);
    // The parser accepts a fresh command after the reset.
    parser.read(b"1(dtn://c/);", &mut out).unwrap();
    assert_eq!(out.len(), 1);
}

#[test]
fn unknown_command_type_is_an_error() {
    assert!(parse_all(b"9(dtn://b/);").is_err());
}

#[test]
fn contact_times_must_fit_before_scaling() {
    // 2^64 / 1000 overflows on multiplication by 1000.
    let input = format!("1(dtn://b/)::[{{{},20,1000}}];", u64::MAX / 1000);
    assert!(parse_all(input.as_bytes()).is_err());
    // A bounded value passes.
    assert!(parse_all(b"1(dtn://b/)::[{18446744073709549,18446744073709550,1}];").is_ok());
}

#[test]
fn empty_lists_are_valid() {
    let commands = parse_all(b"1(dtn://b/):(mtcp:x):[]:[];").unwrap();
    assert!(commands[0].node.endpoints.is_empty());
    assert!(commands[0].node.contacts.is_empty());
}
